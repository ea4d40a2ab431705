//! 命令结果的类型化回复
//!
//! 核心只产生结构化的回复，渲染成文本由传输层负责。

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::entities::rank::Rank;
use crate::value_objects::Timestamp;

/// 回复类型（封闭枚举）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// 自由文本（motd、签名广播等）
    Custom { text: String },
    Success,
    BooleanConfig { description: String, enabled: bool },

    ChatJoin,
    ChatLeave,
    UserInChat,
    UserNotInChat,
    GivenCooldown { duration: Duration, deleted: bool },
    MessageDeleted,
    PromotedMod,
    PromotedAdmin,
    Demoted,
    KarmaThankYou,
    KarmaNotification,
    TripcodeInfo { tripcode: Option<String> },
    TripcodeSet { tripname: String, triphash: String },
    NewUser,
    WhitelistSuccess,
    /// 某位用户私下向消息作者公开了自己：`name` 是其匿名名，`handle` 是真实名称
    ExposeTo { name: String, handle: String },
    Exposed,
    HelpModerator,
    HelpAdmin,
    /// 管理员签名的广播
    ModMessage { text: String },
    AdminMessage { text: String },
    Lockdown { enabled: bool },
    Mute { enabled: bool },
    MessageLocked { locked: bool },
    Muzzled { muzzled: bool },
    CleanedUp { count: usize },

    UserInfo {
        oid: String,
        username: String,
        rank: Rank,
        karma: i64,
        warnings: u32,
        warn_expiry: Option<Timestamp>,
        cooldown: Option<Timestamp>,
    },
    UserInfoMod {
        oid: String,
        karma: i64,
        cooldown: Option<Timestamp>,
        muzzled: bool,
    },
    UsersInfo { count: usize },
    UsersInfoExtended {
        active: usize,
        inactive: usize,
        blacklisted: usize,
        total: usize,
    },

    ErrCommandDisabled,
    ErrNoEditing,
    ErrNotInCache,
    ErrNoUser,
    ErrNoUserById,
    ErrAlreadyWarned,
    ErrNotInCooldown,
    ErrCooldown { until: Timestamp },
    ErrNotWhitelisted { contact: Option<String> },
    ErrAlreadyWhitelisted,
    ErrNotBlacklisted,
    ErrAlreadyBlacklisted,
    ErrBlacklisted {
        reason: Option<String>,
        contact: Option<String>,
    },
    ErrAlreadyUpvoted,
    ErrUpvoteOwnMessage,
    ErrMessageLocked,
    ErrSpammy,
    ErrSpammyTripcode { time_left: Duration },
    ErrInvalidTripFormat,
    ErrNoTripcode,
    ErrNeedTripcode,
    ErrMediaLimit,
    ErrNothingToDo,
    ErrExposeConfirm,
}

impl Reply {
    pub fn custom(text: impl Into<String>) -> Self {
        Reply::Custom { text: text.into() }
    }

    pub fn boolean_config(description: impl Into<String>, enabled: bool) -> Self {
        Reply::BooleanConfig {
            description: description.into(),
            enabled,
        }
    }

    /// 是否为拒绝类回复
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Reply::ErrCommandDisabled
                | Reply::ErrNoEditing
                | Reply::ErrNotInCache
                | Reply::ErrNoUser
                | Reply::ErrNoUserById
                | Reply::ErrAlreadyWarned
                | Reply::ErrNotInCooldown
                | Reply::ErrCooldown { .. }
                | Reply::ErrNotWhitelisted { .. }
                | Reply::ErrAlreadyWhitelisted
                | Reply::ErrNotBlacklisted
                | Reply::ErrAlreadyBlacklisted
                | Reply::ErrBlacklisted { .. }
                | Reply::ErrAlreadyUpvoted
                | Reply::ErrUpvoteOwnMessage
                | Reply::ErrMessageLocked
                | Reply::ErrSpammy
                | Reply::ErrSpammyTripcode { .. }
                | Reply::ErrInvalidTripFormat
                | Reply::ErrNoTripcode
                | Reply::ErrNeedTripcode
                | Reply::ErrMediaLimit
                | Reply::ErrNothingToDo
                | Reply::ErrExposeConfirm
        )
    }
}

/// 一个命令产生的有序回复列表，空表示静默忽略
pub type Replies = Vec<Reply>;
