use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Duration};

use crate::entities::rank::Rank;
use crate::tripcode::{Tripcode, TripcodeIdentity};
use crate::value_objects::{Timestamp, UserId};
use crate::warning::WarningPolicy;

const OID_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// 儒略日与公历序数日（0001-01-01 为第 1 天）之差
const ORDINAL_OFFSET: i32 = 1_721_425;

/// 会话生命周期状态（由记录字段推导，不单独存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Joined,
    /// 加入请求被白名单拦下，等待管理员批准
    AwaitingWhitelist,
    Left,
    Blacklisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
    pub realname: String,
    pub rank: Rank,
    pub joined: Timestamp,
    pub left: Option<Timestamp>,
    pub last_active: Timestamp,
    pub cooldown_until: Option<Timestamp>,
    pub blacklist_reason: Option<String>,
    pub warnings: u32,
    pub warn_expiry: Option<Timestamp>,
    pub karma: i64,
    pub hide_karma: bool,
    pub muzzled: bool,
    pub debug_enabled: bool,
    pub tripcode: Option<Tripcode>,
    pub tripname: Option<String>,
    pub triphash: Option<String>,
    pub salt: String,
    pub tripcode_toggle: bool,
    pub tripcode_last_used: Option<Timestamp>,
    #[serde(default)]
    pub awaiting_whitelist: bool,
}

impl User {
    /// 首次加入时创建记录
    pub fn register(id: UserId, realname: impl Into<String>, salt: String, now: Timestamp) -> Self {
        Self {
            id,
            username: None,
            realname: realname.into(),
            rank: Rank::User,
            joined: now,
            left: None,
            last_active: now,
            cooldown_until: None,
            blacklist_reason: None,
            warnings: 0,
            warn_expiry: None,
            karma: 0,
            hide_karma: false,
            muzzled: false,
            debug_enabled: false,
            tripcode: None,
            tripname: None,
            triphash: None,
            salt,
            tripcode_toggle: false,
            tripcode_last_used: None,
            awaiting_whitelist: false,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.left.is_none()
    }

    pub fn is_blacklisted(&self) -> bool {
        self.rank.value() < 0
    }

    pub fn is_in_cooldown(&self, now: Timestamp) -> bool {
        matches!(self.cooldown_until, Some(until) if until >= now)
    }

    pub fn membership(&self) -> Membership {
        if self.is_blacklisted() {
            Membership::Blacklisted
        } else if self.is_joined() {
            Membership::Joined
        } else if self.awaiting_whitelist {
            Membership::AwaitingWhitelist
        } else {
            Membership::Left
        }
    }

    pub fn set_left(&mut self, now: Timestamp) {
        self.left = Some(now);
    }

    pub fn rejoin(&mut self) {
        self.left = None;
        self.awaiting_whitelist = false;
    }

    /// 加入被白名单拦下：保持离开状态，直到被批准
    pub fn hold_for_whitelist(&mut self, now: Timestamp) {
        if self.left.is_none() {
            self.set_left(now);
        }
        self.awaiting_whitelist = true;
    }

    /// 封禁用户：同时离开会话
    pub fn set_blacklisted(&mut self, reason: impl Into<String>, now: Timestamp) {
        self.set_left(now);
        self.awaiting_whitelist = false;
        self.blacklist_reason = Some(reason.into());
        self.rank = Rank::Banned;
    }

    /// 解除封禁：等级重置为 user，需要重新加入
    pub fn unblacklist(&mut self) {
        self.blacklist_reason = None;
        self.rank = Rank::User;
    }

    /// 增加一次警告，返回本次冷却时长
    pub fn add_warning(&mut self, policy: &WarningPolicy, now: Timestamp) -> Duration {
        let cooldown = policy.cooldown_for(self.warnings);
        self.cooldown_until = Some(now + cooldown);
        self.warnings += 1;
        self.warn_expiry = Some(now + policy.expiry);
        cooldown
    }

    /// 移除一次警告，不会低于 0
    pub fn remove_warning(&mut self, policy: &WarningPolicy, now: Timestamp) {
        self.warnings = self.warnings.saturating_sub(1);
        if self.warnings > 0 {
            self.warn_expiry = Some(now + policy.expiry);
        } else {
            self.warn_expiry = None;
        }
    }

    /// 设置新的 tripcode 并重新派生显示身份
    pub fn set_tripcode(&mut self, tripcode: Tripcode, now: Timestamp) -> TripcodeIdentity {
        let identity = tripcode.derive(&self.salt);
        self.tripname = Some(identity.name.clone());
        self.triphash = Some(identity.hash.clone());
        self.tripcode = Some(tripcode);
        self.tripcode_last_used = Some(now);
        identity
    }

    pub fn tripcode_identity(&self) -> Option<TripcodeIdentity> {
        match (&self.tripname, &self.triphash) {
            (Some(name), Some(hash)) => Some(TripcodeIdentity {
                name: name.clone(),
                hash: hash.clone(),
            }),
            _ => None,
        }
    }

    /// 按日轮换的混淆ID（OID）
    pub fn obfuscated_id(&self, today: Date) -> String {
        let mut salt = i64::from(today.to_julian_day() - ORDINAL_OFFSET);
        if salt & 0xff == 0 {
            salt >>= 8;
        }
        let value = self.id.0.wrapping_mul(salt) & 0xff_ffff;
        [0, 5, 10, 15]
            .iter()
            .map(|shift| OID_ALPHABET[((value >> shift) % 32) as usize] as char)
            .collect()
    }

    /// 管理员看到的带抖动的 karma，降低通过时间关联反匿名化的可能
    pub fn obfuscated_karma(&self, rng: &mut impl Rng) -> i64 {
        let offset = ((self.karma as f64 * 0.2).abs().round() as i64) + 2;
        self.karma + rng.random_range(0..=offset + 1) - offset
    }

    pub fn formatted_name(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username}"),
            None if !self.realname.is_empty() => self.realname.clone(),
            None => "anon".to_owned(),
        }
    }

    pub fn anonymized_name(&self, today: Date) -> String {
        match self.tripcode_identity() {
            Some(identity) if self.tripcode.is_some() => {
                format!("{}{}", identity.name, identity.hash)
            }
            _ => self.obfuscated_id(today),
        }
    }

    /// 投递优先级，数值越小越优先：高等级优先，同等级下最近活跃者优先
    pub fn message_priority(&self, now: Timestamp) -> u64 {
        let rank_part = (Rank::MAX.value() - self.rank.value().max(0)) as u64;
        let inactive = (now - self.last_active).whole_minutes().clamp(0, 0xffff) as u64;
        rank_part << 16 | inactive
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.formatted_name(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use time::macros::{date, datetime};

    fn sample_user() -> User {
        User::register(
            UserId(123_456_789),
            "Test",
            "4242".to_owned(),
            datetime!(2024-01-01 00:00 UTC),
        )
    }

    #[test]
    fn test_membership_invariants() {
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();
        assert!(user.is_joined());
        assert_eq!(user.membership(), Membership::Joined);

        user.set_left(now);
        assert!(!user.is_joined());
        assert_eq!(user.membership(), Membership::Left);

        user.rejoin();
        user.set_blacklisted("spam", now);
        assert!(user.is_blacklisted());
        assert!(!user.is_joined());
        assert_eq!(user.membership(), Membership::Blacklisted);

        user.unblacklist();
        assert_eq!(user.rank, Rank::User);
        assert!(!user.is_blacklisted());
        assert!(!user.is_joined());
    }

    #[test]
    fn test_whitelist_hold_is_distinct_from_leaving() {
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();
        user.set_left(now);
        assert_eq!(user.membership(), Membership::Left);

        user.hold_for_whitelist(now);
        assert!(!user.is_joined());
        assert_eq!(user.membership(), Membership::AwaitingWhitelist);

        user.rejoin();
        assert!(user.is_joined());
        assert!(!user.awaiting_whitelist);

        user.hold_for_whitelist(now);
        user.set_blacklisted("spam", now);
        assert_eq!(user.membership(), Membership::Blacklisted);
        assert!(!user.awaiting_whitelist);
    }

    #[test]
    fn test_warning_schedule_and_cooldown() {
        let policy = WarningPolicy::default();
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();

        for (i, minutes) in policy.cooldown_minutes.clone().into_iter().enumerate() {
            let duration = user.add_warning(&policy, now);
            assert_eq!(duration, Duration::minutes(minutes));
            assert_eq!(user.warnings, i as u32 + 1);
        }
        let k = policy.cooldown_minutes.len() as i64;
        for x in 0..3 {
            let duration = user.add_warning(&policy, now);
            assert_eq!(duration, Duration::minutes(policy.linear_m * x + policy.linear_b));
            assert_eq!(i64::from(user.warnings), k + x + 1);
        }

        assert!(user.is_in_cooldown(now));
        assert_eq!(user.warn_expiry, Some(now + policy.expiry));
    }

    #[test]
    fn test_remove_warning_never_negative_and_clears_expiry() {
        let policy = WarningPolicy::default();
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();

        user.remove_warning(&policy, now);
        assert_eq!(user.warnings, 0);
        assert_eq!(user.warn_expiry, None);

        user.add_warning(&policy, now);
        user.add_warning(&policy, now);
        user.remove_warning(&policy, now);
        assert_eq!(user.warnings, 1);
        assert!(user.warn_expiry.is_some());

        user.remove_warning(&policy, now);
        assert_eq!(user.warnings, 0);
        assert_eq!(user.warn_expiry, None);
    }

    #[test]
    fn test_cooldown_expires() {
        let policy = WarningPolicy::default();
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();
        user.add_warning(&policy, now);

        assert!(user.is_in_cooldown(now + Duration::seconds(59)));
        assert!(!user.is_in_cooldown(now + Duration::minutes(2)));
    }

    #[test]
    fn test_obfuscated_id_rotates_daily() {
        let user = sample_user();
        let a = user.obfuscated_id(date!(2024 - 03 - 01));
        let b = user.obfuscated_id(date!(2024 - 03 - 01));
        let c = user.obfuscated_id(date!(2024 - 03 - 02));

        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_ne!(a, c);
    }

    #[test]
    fn test_obfuscated_id_uses_ordinal_day() {
        // 2024-03-01 是公历第 738946 天
        let user = sample_user();
        assert_eq!(user.obfuscated_id(date!(2024 - 03 - 01)), "aloh");

        let mut small = sample_user();
        small.id = UserId(2);
        assert_eq!(small.obfuscated_id(date!(2024 - 03 - 01)), "483d");
    }

    #[test]
    fn test_obfuscated_karma_is_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut user = sample_user();
        user.karma = 100;
        // offset = round(20) + 2 = 22
        for _ in 0..200 {
            let shown = user.obfuscated_karma(&mut rng);
            assert!((100 - 22..=100 + 1).contains(&shown), "{shown}");
        }
    }

    #[test]
    fn test_message_priority() {
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();
        user.last_active = now - Duration::minutes(30);
        let user_priority = user.message_priority(now);
        assert_eq!(user_priority, (1000u64 << 16) | 30);

        user.rank = Rank::Owner;
        assert_eq!(user.message_priority(now), 30);

        user.rank = Rank::Banned;
        assert_eq!(user.message_priority(now), user_priority);

        user.rank = Rank::User;
        user.last_active = now - Duration::days(365);
        assert_eq!(user.message_priority(now), (1000u64 << 16) | 0xffff);
    }

    #[test]
    fn test_tripcode_identity() {
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut user = sample_user();
        assert_eq!(user.tripcode_identity(), None);

        let trip = Tripcode::parse("anon#secret").unwrap();
        let identity = user.set_tripcode(trip, now);
        assert_eq!(user.tripcode_identity(), Some(identity.clone()));
        assert_eq!(user.tripcode_last_used, Some(now));
        assert_eq!(
            user.anonymized_name(date!(2024 - 01 - 01)),
            format!("{}{}", identity.name, identity.hash)
        );
    }
}
