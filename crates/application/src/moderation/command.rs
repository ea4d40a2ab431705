use domain::{MessageContent, MessageId, Rank, TransportMessageId, User, UserId};

use crate::clock::Clock;

/// 发起操作的用户，字段来自传输层事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub username: Option<String>,
    pub realname: String,
}

impl Actor {
    pub fn new(id: impl Into<UserId>, username: Option<String>, realname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username,
            realname: realname.into(),
        }
    }

    /// 用最新的事件信息刷新记录
    pub(crate) fn apply_to(&self, user: &mut User, clock: &dyn Clock) {
        user.username = self.username.clone();
        user.realname = self.realname.clone();
        user.last_active = clock.now();
    }
}

/// 对某条消息的引用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRef {
    Id(MessageId),
    /// 发起者会话中某份副本的传输层ID
    Reply(TransportMessageId),
}

/// 被操作的用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 某条缓存消息的作者
    Message(MessageRef),
    Username(String),
    Oid(String),
    Id(UserId),
}

/// 转发时的署名方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Signing {
    #[default]
    Anonymous,
    Tripcode,
    Expose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub content: MessageContent,
    /// 作者回复的消息（作者会话中的传输层ID）
    pub reply_to: Option<TransportMessageId>,
    /// 作者自己这份消息的传输层ID
    pub source_id: Option<TransportMessageId>,
    pub signing: Signing,
}

impl RelayRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: MessageContent::text(text),
            reply_to: None,
            source_id: None,
            signing: Signing::Anonymous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRequest {
    pub source_id: TransportMessageId,
    pub content: MessageContent,
    pub signing: Signing,
}

/// 审核引擎可执行的全部命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join,
    Leave,
    Info,
    ModInfo(MessageRef),
    Users,
    Motd,
    SetMotd(String),
    Help,
    SetHelp(String),
    ModHelp,
    AdminHelp,
    ToggleDebug,
    ToggleKarma,
    ToggleTripcode,
    Tripcode,
    SetTripcode(String),
    Promote { target: Target, rank: Rank },
    Demote(Target),
    Warn { message: MessageRef, delete: bool },
    Remove(MessageRef),
    Uncooldown(Target),
    Whitelist(Target),
    Unwhitelist(Target),
    Blacklist { target: Target, reason: String },
    Unblacklist(Target),
    Muzzle { target: Target, muzzled: bool },
    Lock { message: MessageRef, locked: bool },
    GiveKarma(MessageRef),
    /// 向某条消息的作者私下公开自己；`confirmed` 防止误操作
    ExposeTo { message: MessageRef, confirmed: bool },
    ResetKarma(Target),
    ModSay(String),
    AdminSay(String),
    Cleanup(Target),
    Lockdown,
    Mute,
    Relay(RelayRequest),
    Edit(EditRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join => "join",
            Command::Leave => "leave",
            Command::Info => "info",
            Command::ModInfo(_) => "mod_info",
            Command::Users => "users",
            Command::Motd => "motd",
            Command::SetMotd(_) => "set_motd",
            Command::Help => "help",
            Command::SetHelp(_) => "set_help",
            Command::ModHelp => "mod_help",
            Command::AdminHelp => "admin_help",
            Command::ToggleDebug => "toggle_debug",
            Command::ToggleKarma => "toggle_karma",
            Command::ToggleTripcode => "toggle_tripcode",
            Command::Tripcode => "tripcode",
            Command::SetTripcode(_) => "set_tripcode",
            Command::Promote { .. } => "promote",
            Command::Demote(_) => "demote",
            Command::Warn { .. } => "warn",
            Command::Remove(_) => "remove",
            Command::Uncooldown(_) => "uncooldown",
            Command::Whitelist(_) => "whitelist",
            Command::Unwhitelist(_) => "unwhitelist",
            Command::Blacklist { .. } => "blacklist",
            Command::Unblacklist(_) => "unblacklist",
            Command::Muzzle { .. } => "muzzle",
            Command::Lock { .. } => "lock",
            Command::GiveKarma(_) => "give_karma",
            Command::ExposeTo { .. } => "expose_to",
            Command::ResetKarma(_) => "reset_karma",
            Command::ModSay(_) => "mod_say",
            Command::AdminSay(_) => "admin_say",
            Command::Cleanup(_) => "cleanup",
            Command::Lockdown => "lockdown",
            Command::Mute => "mute",
            Command::Relay(_) => "relay",
            Command::Edit(_) => "edit",
        }
    }
}
