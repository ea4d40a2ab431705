use std::collections::HashSet;

use time::Duration;

use crate::value_objects::{MessageId, Timestamp, UserId};

/// 缓存中的逻辑消息及其管理元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub id: MessageId,
    /// 作者；系统广播为 None
    pub user_id: Option<UserId>,
    pub warned: bool,
    pub locked: bool,
    pub upvoted: HashSet<UserId>,
    pub created_at: Timestamp,
}

impl CachedMessage {
    pub fn new(id: MessageId, user_id: Option<UserId>, now: Timestamp) -> Self {
        Self {
            id,
            user_id,
            warned: false,
            locked: false,
            upvoted: HashSet::new(),
            created_at: now,
        }
    }

    pub fn is_authored_by(&self, user_id: UserId) -> bool {
        self.user_id == Some(user_id)
    }

    pub fn has_upvoted(&self, user_id: UserId) -> bool {
        self.upvoted.contains(&user_id)
    }

    /// 记录一次点赞，重复点赞返回 false
    pub fn add_upvote(&mut self, user_id: UserId) -> bool {
        self.upvoted.insert(user_id)
    }

    pub fn is_expired(&self, now: Timestamp, ttl: Duration) -> bool {
        now - self.created_at >= ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_upvotes_are_distinct() {
        let now = datetime!(2024-01-01 00:00 UTC);
        let mut cm = CachedMessage::new(MessageId(1), Some(UserId(10)), now);

        assert!(!cm.has_upvoted(UserId(11)));
        assert!(cm.add_upvote(UserId(11)));
        assert!(!cm.add_upvote(UserId(11)));
        assert!(cm.has_upvoted(UserId(11)));
        assert_eq!(cm.upvoted.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let now = datetime!(2024-01-01 00:00 UTC);
        let cm = CachedMessage::new(MessageId(1), None, now);
        let ttl = Duration::hours(36);

        assert!(!cm.is_expired(now + Duration::hours(35), ttl));
        assert!(cm.is_expired(now + ttl, ttl));
        assert!(!cm.is_authored_by(UserId(1)));
    }
}
