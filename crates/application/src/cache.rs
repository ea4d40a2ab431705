//! 消息身份缓存
//!
//! 一条逻辑消息（msid）对应每个接收者的一份副本，每份副本在传输层有独立的ID。
//! 缓存负责分配 msid、维护双向映射以及按 TTL 淘汰。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use domain::{CachedMessage, MessageId, TransportMessageId, UserId};
use time::Duration;
use tracing::debug;

use crate::clock::Clock;

/// 某个接收者副本的投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// 已入队但尚未拿到传输层ID
    Pending,
    Sent(TransportMessageId),
}

impl Delivered {
    pub fn sent(self) -> Option<TransportMessageId> {
        match self {
            Delivered::Sent(id) => Some(id),
            Delivered::Pending => None,
        }
    }
}

#[derive(Default)]
struct CacheState {
    next_id: u64,
    messages: HashMap<MessageId, CachedMessage>,
    copies: HashMap<MessageId, HashMap<UserId, Delivered>>,
    reverse: HashMap<(UserId, TransportMessageId), MessageId>,
}

impl CacheState {
    fn drop_copies(&mut self, msid: MessageId) {
        if let Some(copies) = self.copies.remove(&msid) {
            for (recipient, delivered) in copies {
                if let Delivered::Sent(id) = delivered {
                    self.reverse.remove(&(recipient, id));
                }
            }
        }
    }
}

pub struct IdentityCache {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl IdentityCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            clock,
            ttl,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 分配新的 msid；作者为 None 表示系统广播
    pub fn assign(&self, author: Option<UserId>) -> MessageId {
        let now = self.clock.now();
        let mut state = self.state();
        let msid = MessageId(state.next_id);
        state.next_id += 1;
        state
            .messages
            .insert(msid, CachedMessage::new(msid, author, now));
        msid
    }

    pub fn get(&self, msid: MessageId) -> Option<CachedMessage> {
        self.state().messages.get(&msid).cloned()
    }

    /// 在锁内修改缓存元数据，消息不存在时返回 None
    pub fn update<F, R>(&self, msid: MessageId, f: F) -> Option<R>
    where
        F: FnOnce(&mut CachedMessage) -> R,
    {
        self.state().messages.get_mut(&msid).map(f)
    }

    /// 写入映射；msid 已不在缓存中时忽略并返回 false
    pub fn save_mapping(&self, recipient: UserId, msid: MessageId, delivered: Delivered) -> bool {
        let mut state = self.state();
        if !state.messages.contains_key(&msid) {
            return false;
        }
        let previous = state
            .copies
            .entry(msid)
            .or_default()
            .insert(recipient, delivered);
        if let Some(Delivered::Sent(old)) = previous {
            state.reverse.remove(&(recipient, old));
        }
        if let Delivered::Sent(id) = delivered {
            state.reverse.insert((recipient, id), msid);
        }
        true
    }

    pub fn lookup_transport_id(&self, recipient: UserId, msid: MessageId) -> Option<Delivered> {
        self.state()
            .copies
            .get(&msid)
            .and_then(|copies| copies.get(&recipient))
            .copied()
    }

    pub fn lookup_msid(&self, recipient: UserId, id: TransportMessageId) -> Option<MessageId> {
        self.state().reverse.get(&(recipient, id)).copied()
    }

    /// 某条消息所有接收者的副本
    pub fn copies(&self, msid: MessageId) -> Vec<(UserId, Delivered)> {
        let mut copies: Vec<_> = self
            .state()
            .copies
            .get(&msid)
            .map(|copies| copies.iter().map(|(u, d)| (*u, *d)).collect())
            .unwrap_or_default();
        copies.sort_by_key(|(u, _)| *u);
        copies
    }

    pub fn delete_mappings(&self, msid: MessageId) {
        self.state().drop_copies(msid);
    }

    /// 某个作者仍在缓存中的全部消息
    pub fn all_mappings(&self, author: UserId) -> HashSet<MessageId> {
        self.state()
            .messages
            .values()
            .filter(|cm| cm.is_authored_by(author))
            .map(|cm| cm.id)
            .collect()
    }

    /// 淘汰超过 TTL 的消息及其映射，返回被淘汰的 msid
    pub fn expire(&self) -> HashSet<MessageId> {
        let now = self.clock.now();
        let mut state = self.state();
        let expired: HashSet<MessageId> = state
            .messages
            .values()
            .filter(|cm| cm.is_expired(now, self.ttl))
            .map(|cm| cm.id)
            .collect();
        for msid in &expired {
            state.messages.remove(msid);
            state.drop_copies(*msid);
        }
        debug!(
            expired = expired.len(),
            remaining = state.messages.len(),
            "Cache expiry sweep"
        );
        expired
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn cache() -> (Arc<ManualClock>, IdentityCache) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00 UTC)));
        let cache = IdentityCache::new(clock.clone(), Duration::hours(36));
        (clock, cache)
    }

    #[test]
    fn test_assign_is_sequential() {
        let (_, cache) = cache();
        let a = cache.assign(Some(UserId(1)));
        let b = cache.assign(None);
        assert_eq!(b.0, a.0 + 1);
        assert_eq!(cache.get(a).unwrap().user_id, Some(UserId(1)));
        assert_eq!(cache.get(b).unwrap().user_id, None);
        assert!(cache.get(MessageId(99)).is_none());
    }

    #[test]
    fn test_mapping_is_bidirectional_and_pending_is_replaced() {
        let (_, cache) = cache();
        let msid = cache.assign(Some(UserId(1)));

        assert!(cache.save_mapping(UserId(2), msid, Delivered::Pending));
        assert_eq!(
            cache.lookup_transport_id(UserId(2), msid),
            Some(Delivered::Pending)
        );
        assert_eq!(cache.lookup_msid(UserId(2), TransportMessageId(77)), None);

        assert!(cache.save_mapping(UserId(2), msid, Delivered::Sent(TransportMessageId(77))));
        assert_eq!(cache.lookup_msid(UserId(2), TransportMessageId(77)), Some(msid));
        assert_eq!(
            cache.lookup_transport_id(UserId(2), msid),
            Some(Delivered::Sent(TransportMessageId(77)))
        );
        // 同一传输层ID在不同接收者之间互不干扰
        assert_eq!(cache.lookup_msid(UserId(3), TransportMessageId(77)), None);
    }

    #[test]
    fn test_save_mapping_ignores_unknown_msid() {
        let (_, cache) = cache();
        assert!(!cache.save_mapping(UserId(2), MessageId(5), Delivered::Pending));
        assert!(cache.copies(MessageId(5)).is_empty());
    }

    #[test]
    fn test_delete_mappings_keeps_metadata() {
        let (_, cache) = cache();
        let msid = cache.assign(Some(UserId(1)));
        cache.save_mapping(UserId(2), msid, Delivered::Sent(TransportMessageId(10)));
        cache.save_mapping(UserId(3), msid, Delivered::Pending);

        cache.delete_mappings(msid);
        assert!(cache.copies(msid).is_empty());
        assert_eq!(cache.lookup_msid(UserId(2), TransportMessageId(10)), None);
        assert!(cache.get(msid).is_some());
    }

    #[test]
    fn test_update_and_all_mappings() {
        let (_, cache) = cache();
        let a = cache.assign(Some(UserId(1)));
        let b = cache.assign(Some(UserId(1)));
        let _c = cache.assign(Some(UserId(2)));

        assert_eq!(cache.update(a, |cm| std::mem::replace(&mut cm.warned, true)), Some(false));
        assert_eq!(cache.update(a, |cm| std::mem::replace(&mut cm.warned, true)), Some(true));
        assert_eq!(cache.update(MessageId(42), |cm| cm.locked = true), None);

        let authored = cache.all_mappings(UserId(1));
        assert_eq!(authored, HashSet::from([a, b]));
    }

    #[test]
    fn test_expire_removes_message_and_mappings() {
        let (clock, cache) = cache();
        let old = cache.assign(Some(UserId(1)));
        cache.save_mapping(UserId(2), old, Delivered::Sent(TransportMessageId(1)));
        clock.advance(Duration::hours(20));
        let young = cache.assign(Some(UserId(1)));
        clock.advance(Duration::hours(20));

        let expired = cache.expire();
        assert_eq!(expired, HashSet::from([old]));
        assert!(cache.get(old).is_none());
        assert!(cache.copies(old).is_empty());
        assert_eq!(cache.lookup_transport_id(UserId(2), old), None);
        assert_eq!(cache.lookup_msid(UserId(2), TransportMessageId(1)), None);
        assert!(cache.get(young).is_some());

        // 过期后不能再写入映射
        assert!(!cache.save_mapping(UserId(2), old, Delivered::Pending));
    }
}
