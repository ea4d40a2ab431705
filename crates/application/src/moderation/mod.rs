//! 审核引擎
//!
//! 用户生命周期与审核命令的状态机，是用户记录与缓存消息元数据的唯一写入方。
//! 每个命令都返回一组类型化的回复，空集合表示静默忽略。
//!
//! 命令处理遵循固定的守卫链：解析操作者 → 会话/封禁检查 → 等级检查 → 执行。

mod command;
mod membership;
mod relay;
mod staff;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::{FeaturesConfig, KarmaConfig, RelayConfig};
use domain::{MessageId, Rank, Replies, Reply, SpamCostTable, Timestamp, User, WarningPolicy};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cache::IdentityCache;
use crate::clock::Clock;
use crate::dispatcher::{Audience, Dispatcher};
use crate::spam_gate::SpamGate;
use crate::store::{StoreError, UserLedger, UserOrder, UserStore};

pub use command::{Actor, Command, EditRequest, MessageRef, RelayRequest, Signing, Target};

/// 引擎使用的配置快照
#[derive(Debug, Clone)]
pub struct ModerationSettings {
    pub warnings: WarningPolicy,
    pub karma: KarmaConfig,
    pub costs: SpamCostTable,
    pub features: FeaturesConfig,
}

impl From<&RelayConfig> for ModerationSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            warnings: config.warnings.policy(),
            karma: config.karma.clone(),
            costs: config.spam.costs.clone(),
            features: config.features.clone(),
        }
    }
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

pub struct ModerationDependencies {
    pub store: Arc<dyn UserStore>,
    pub cache: Arc<IdentityCache>,
    pub spam_gate: Arc<SpamGate>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    pub settings: ModerationSettings,
}

/// 命令被拒绝的方式
#[derive(Debug)]
pub(crate) enum Rejection {
    /// 以类型化回复告知操作者
    Reply(Reply),
    /// 权限不足：不给出任何回复
    Silent,
    /// 存储故障：记录日志，不给出回复
    Store(StoreError),
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        Rejection::Store(err)
    }
}

impl From<Reply> for Rejection {
    fn from(reply: Reply) -> Self {
        Rejection::Reply(reply)
    }
}

pub(crate) type Outcome = Result<Replies, Rejection>;

pub struct ModerationEngine {
    ledger: UserLedger,
    cache: Arc<IdentityCache>,
    spam_gate: Arc<SpamGate>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    settings: ModerationSettings,
    lockdown: AtomicBool,
    mute: AtomicBool,
}

impl ModerationEngine {
    pub fn new(deps: ModerationDependencies) -> Self {
        Self {
            ledger: UserLedger::new(deps.store),
            cache: deps.cache,
            spam_gate: deps.spam_gate,
            dispatcher: deps.dispatcher,
            clock: deps.clock,
            settings: deps.settings,
            lockdown: AtomicBool::new(false),
            mute: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ModerationSettings {
        &self.settings
    }

    pub fn is_lockdown(&self) -> bool {
        self.lockdown.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::SeqCst)
    }

    fn store(&self) -> &Arc<dyn UserStore> {
        self.ledger.store()
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// 执行一条命令；从不向调用方返回错误
    pub async fn execute(&self, actor: &Actor, command: Command) -> Replies {
        let name = command.name();
        debug!(user_id = %actor.id, command = name, "Executing command");

        let outcome = match command {
            Command::Join => self.join(actor).await,
            Command::Leave => self.leave(actor).await,
            Command::Info => self.info(actor).await,
            Command::ModInfo(message) => self.mod_info(actor, message).await,
            Command::Users => self.users(actor).await,
            Command::Motd => self.motd(actor).await,
            Command::SetMotd(text) => self.set_motd(actor, text).await,
            Command::Help => self.help(actor).await,
            Command::SetHelp(text) => self.set_help(actor, text).await,
            Command::ModHelp => self.staff_help(actor, Rank::Mod).await,
            Command::AdminHelp => self.staff_help(actor, Rank::Admin).await,
            Command::ToggleDebug => self.toggle_debug(actor).await,
            Command::ToggleKarma => self.toggle_karma(actor).await,
            Command::ToggleTripcode => self.toggle_tripcode(actor).await,
            Command::Tripcode => self.tripcode(actor).await,
            Command::SetTripcode(text) => self.set_tripcode(actor, &text).await,
            Command::Promote { target, rank } => self.promote(actor, target, rank).await,
            Command::Demote(target) => self.demote(actor, target).await,
            Command::Warn { message, delete } => self.warn(actor, message, delete).await,
            Command::Remove(message) => self.remove_message(actor, message).await,
            Command::Uncooldown(target) => self.uncooldown(actor, target).await,
            Command::Whitelist(target) => self.whitelist(actor, target).await,
            Command::Unwhitelist(target) => self.unwhitelist(actor, target).await,
            Command::Blacklist { target, reason } => self.blacklist(actor, target, reason).await,
            Command::Unblacklist(target) => self.unblacklist(actor, target).await,
            Command::Muzzle { target, muzzled } => self.muzzle(actor, target, muzzled).await,
            Command::Lock { message, locked } => self.lock(actor, message, locked).await,
            Command::GiveKarma(message) => self.give_karma(actor, message).await,
            Command::ExposeTo { message, confirmed } => {
                self.expose_to(actor, message, confirmed).await
            }
            Command::ResetKarma(target) => self.reset_karma(actor, target).await,
            Command::ModSay(text) => self.mod_say(actor, text).await,
            Command::AdminSay(text) => self.admin_say(actor, text).await,
            Command::Cleanup(target) => self.cleanup(actor, target).await,
            Command::Lockdown => self.toggle_lockdown(actor).await,
            Command::Mute => self.toggle_mute(actor).await,
            Command::Relay(request) => self.relay_message(actor, request).await,
            Command::Edit(request) => self.edit_message(actor, request).await,
        };

        match outcome {
            Ok(replies) => replies,
            Err(Rejection::Reply(reply)) => vec![reply],
            Err(Rejection::Silent) => {
                debug!(user_id = %actor.id, command = name, "Command silently rejected");
                Vec::new()
            }
            Err(Rejection::Store(e)) => {
                error!(user_id = %actor.id, command = name, error = %e, "Store failure during command");
                Vec::new()
            }
        }
    }

    /// 解析并刷新操作者，检查封禁与会话状态
    async fn require_user(&self, actor: &Actor) -> Result<User, Rejection> {
        let Some((user, ())) = self
            .ledger
            .modify(actor.id, |user| actor.apply_to(user, self.clock.as_ref()))
            .await?
        else {
            return Err(Reply::UserNotInChat.into());
        };

        if user.is_blacklisted() {
            return Err(self.blacklisted_reply(&user).into());
        }
        if !user.is_joined() {
            return Err(Reply::UserNotInChat.into());
        }
        Ok(user)
    }

    fn require_rank(user: &User, rank: Rank) -> Result<(), Rejection> {
        if user.rank < rank {
            return Err(Rejection::Silent);
        }
        Ok(())
    }

    /// 针对他人的操作要求等级严格高于目标
    fn require_above(user: &User, target: &User) -> Result<(), Rejection> {
        if user.rank <= target.rank {
            return Err(Rejection::Silent);
        }
        Ok(())
    }

    fn blacklisted_reply(&self, user: &User) -> Reply {
        Reply::ErrBlacklisted {
            reason: user.blacklist_reason.clone(),
            contact: self.settings.features.blacklist_contact.clone(),
        }
    }

    fn resolve_message(&self, actor: &Actor, message: MessageRef) -> Result<MessageId, Rejection> {
        let msid = match message {
            MessageRef::Id(msid) => Some(msid),
            MessageRef::Reply(transport_id) => self.cache.lookup_msid(actor.id, transport_id),
        };
        msid.filter(|msid| self.cache.get(*msid).is_some())
            .ok_or(Rejection::Reply(Reply::ErrNotInCache))
    }

    /// 解析目标用户；按用户名或 OID 查找时只匹配已加入的用户
    async fn resolve_target(&self, actor: &Actor, target: &Target) -> Result<User, Rejection> {
        match target {
            Target::Message(message) => {
                let msid = self.resolve_message(actor, *message)?;
                let author = self
                    .cache
                    .get(msid)
                    .and_then(|cm| cm.user_id)
                    .ok_or(Rejection::Reply(Reply::ErrNotInCache))?;
                self.ledger
                    .get(author)
                    .await?
                    .ok_or(Rejection::Reply(Reply::ErrNoUser))
            }
            Target::Username(name) => self
                .find_by_username(name, true)
                .await?
                .ok_or(Rejection::Reply(Reply::ErrNoUser)),
            Target::Oid(oid) => {
                let today = self.now().date();
                let users = self.store().iterate_users(UserOrder::Unordered).await?;
                users
                    .into_iter()
                    .filter(|u| u.is_joined())
                    .find(|u| u.obfuscated_id(today) == *oid)
                    .ok_or(Rejection::Reply(Reply::ErrNoUserById))
            }
            Target::Id(id) => self
                .ledger
                .get(*id)
                .await?
                .ok_or(Rejection::Reply(Reply::ErrNoUser)),
        }
    }

    /// 用户名不区分大小写，可带前导 `@`
    async fn find_by_username(&self, name: &str, joined_only: bool) -> Result<Option<User>, StoreError> {
        let name = name.trim().trim_start_matches('@').to_lowercase();
        let users = self.store().iterate_users(UserOrder::Unordered).await?;
        Ok(users.into_iter().find(|u| {
            (!joined_only || u.is_joined())
                && u.username.as_deref().is_some_and(|n| n.to_lowercase() == name)
        }))
    }

    /// 引擎自身发出的系统消息
    async fn notify(&self, reply: Reply, audience: Audience, reply_to: Option<MessageId>) {
        self.dispatcher.system(reply, audience, reply_to).await;
    }

    async fn notify_admins(&self, reply: Reply, except: Option<domain::UserId>) -> Result<(), Rejection> {
        for admin in self.store().iterate_admins().await? {
            if Some(admin.id) == except {
                continue;
            }
            self.notify(reply.clone(), Audience::User(admin.id), None).await;
        }
        Ok(())
    }

    /// 传输层报告永久不可达，或用户主动离开
    pub async fn force_user_leave(&self, id: domain::UserId, blocked: bool) {
        let now = self.now();
        match self
            .ledger
            .modify(id, |user| {
                if user.is_joined() {
                    user.set_left(now);
                }
                if blocked {
                    user.awaiting_whitelist = false;
                }
            })
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                error!(user_id = %id, error = %e, "Failed to end session");
                return;
            }
        }
        if blocked {
            tracing::warn!(user_id = %id, "Force leaving user because they are unreachable");
        }
        self.dispatcher.stop_invoked(id, false).await;
    }

    /// 移除过期警告，返回处理的用户数
    pub async fn expire_warnings(&self) -> usize {
        let now = self.now();
        let users = match self.store().iterate_users(UserOrder::Unordered).await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to iterate users for warning expiry");
                return 0;
            }
        };

        let mut count = 0;
        for user in users {
            if !user.is_joined() || !user.warn_expiry.is_some_and(|expiry| expiry < now) {
                continue;
            }
            let policy = &self.settings.warnings;
            let result = self
                .ledger
                .modify(user.id, |user| match user.warn_expiry {
                    Some(expiry) if expiry < now => {
                        user.remove_warning(policy, now);
                        true
                    }
                    _ => false,
                })
                .await;
            match result {
                Ok(Some((_, true))) => count += 1,
                Ok(_) => {}
                Err(e) => error!(user_id = %user.id, error = %e, "Failed to expire warning"),
            }
        }
        if count > 0 {
            info!(count, "Expired warnings");
        }
        count
    }

    /// 消费投递层的不可达报告，强制结束对应会话
    pub async fn run_session_reaper(self: Arc<Self>, mut unreachable: mpsc::UnboundedReceiver<domain::UserId>) {
        while let Some(id) = unreachable.recv().await {
            self.force_user_leave(id, true).await;
        }
        debug!("Session reaper stopped");
    }
}
