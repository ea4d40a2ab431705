//! 广播分发层
//!
//! 审核引擎只决定“发给谁、发什么”，具体如何投递由注册的接收器完成。
//! 生产环境注册一个基于投递队列的接收器，也可以并行注册影子接收器。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{MessageId, Outbound, Rank, RelayedMessage, Reply, UserId};
use tracing::{debug, error};

use crate::cache::{Delivered, IdentityCache};
use crate::clock::Clock;
use crate::delivery::{priority_for, DeliveryAction, DeliveryItem, DeliveryQueue};
use crate::error::ApplicationError;
use crate::store::{UserOrder, UserStore};

/// 投递对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// 单播
    User(UserId),
    /// 广播给所有已加入的用户
    Broadcast {
        /// 排除的用户（通常是作者），开启调试模式时仍会收到
        except: Option<UserId>,
        /// 只投递给不低于该等级的用户
        min_rank: Option<Rank>,
    },
}

impl Audience {
    pub fn everyone() -> Self {
        Audience::Broadcast {
            except: None,
            min_rank: None,
        }
    }

    pub fn everyone_except(user: UserId) -> Self {
        Audience::Broadcast {
            except: Some(user),
            min_rank: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Audience::Broadcast { .. })
    }
}

/// 接收器能力集合
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn reply(
        &self,
        message: Arc<Outbound>,
        msid: Option<MessageId>,
        audience: &Audience,
        reply_to: Option<MessageId>,
    ) -> Result<(), ApplicationError>;

    /// 删除某条消息的所有副本，并取消尚未派发的投递
    async fn delete(&self, msid: MessageId, acting: Option<UserId>)
        -> Result<(), ApplicationError>;

    /// 取消发给该用户的待投递条目；cascade 给出时同时取消该用户所写消息的投递
    async fn stop_invoked(
        &self,
        user: UserId,
        cascade: Option<&HashSet<MessageId>>,
    ) -> Result<(), ApplicationError>;

    async fn edit(&self, _msid: MessageId, _message: Arc<Outbound>) -> Result<(), ApplicationError> {
        Ok(())
    }
}

pub struct Dispatcher {
    receivers: Vec<Arc<dyn Receiver>>,
    cache: Arc<IdentityCache>,
}

impl Dispatcher {
    pub fn new(cache: Arc<IdentityCache>) -> Self {
        Self {
            receivers: Vec::new(),
            cache,
        }
    }

    pub fn register(&mut self, receiver: Arc<dyn Receiver>) {
        self.receivers.push(receiver);
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.register(receiver);
        self
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// 推送系统回复；只有广播才分配 msid
    pub async fn system(
        &self,
        reply: Reply,
        audience: Audience,
        reply_to: Option<MessageId>,
    ) -> Option<MessageId> {
        let msid = audience.is_broadcast().then(|| self.cache.assign(None));
        debug!(?reply, ?msid, ?reply_to, "system reply");
        self.fan_out(Arc::new(Outbound::System(reply)), msid, &audience, reply_to)
            .await;
        msid
    }

    /// 转发用户消息，msid 由调用方预先分配
    pub async fn relay(
        &self,
        msid: MessageId,
        message: RelayedMessage,
        audience: Audience,
        reply_to: Option<MessageId>,
    ) {
        debug!(msid = %msid, ?reply_to, "relay");
        self.fan_out(Arc::new(Outbound::Relayed(message)), Some(msid), &audience, reply_to)
            .await;
    }

    async fn fan_out(
        &self,
        message: Arc<Outbound>,
        msid: Option<MessageId>,
        audience: &Audience,
        reply_to: Option<MessageId>,
    ) {
        for receiver in &self.receivers {
            if let Err(e) = receiver
                .reply(message.clone(), msid, audience, reply_to)
                .await
            {
                error!(error = %e, "Receiver failed to handle reply");
            }
        }
    }

    pub async fn delete(&self, msid: MessageId, acting: Option<UserId>) {
        debug!(msid = %msid, "delete");
        for receiver in &self.receivers {
            if let Err(e) = receiver.delete(msid, acting).await {
                error!(error = %e, msid = %msid, "Receiver failed to delete message");
            }
        }
    }

    pub async fn stop_invoked(&self, user: UserId, cascade: bool) {
        debug!(user_id = %user, cascade, "stop_invoked");
        // 在触碰队列之前算好需要的集合
        let authored = cascade.then(|| self.cache.all_mappings(user));
        for receiver in &self.receivers {
            if let Err(e) = receiver.stop_invoked(user, authored.as_ref()).await {
                error!(error = %e, user_id = %user, "Receiver failed to stop deliveries");
            }
        }
    }

    pub async fn edit(&self, msid: MessageId, message: RelayedMessage) {
        debug!(msid = %msid, "edit");
        let message = Arc::new(Outbound::Relayed(message));
        for receiver in &self.receivers {
            if let Err(e) = receiver.edit(msid, message.clone()).await {
                error!(error = %e, msid = %msid, "Receiver failed to edit message");
            }
        }
    }
}

/// 基于投递队列的接收器
pub struct QueueReceiver {
    store: Arc<dyn UserStore>,
    cache: Arc<IdentityCache>,
    queue: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
}

impl QueueReceiver {
    pub fn new(
        store: Arc<dyn UserStore>,
        cache: Arc<IdentityCache>,
        queue: Arc<DeliveryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            clock,
        }
    }

    /// 针对已投递副本的操作优先于普通发送
    const FOLLOW_UP_PRIORITY: u64 = 0;
}

#[async_trait]
impl Receiver for QueueReceiver {
    async fn reply(
        &self,
        message: Arc<Outbound>,
        msid: Option<MessageId>,
        audience: &Audience,
        reply_to: Option<MessageId>,
    ) -> Result<(), ApplicationError> {
        let now = self.clock.now();
        match audience {
            Audience::User(id) => {
                let user = self.store.get_user(*id).await?;
                self.queue.put(
                    priority_for(user.as_ref(), now),
                    DeliveryItem::send(*id, msid, message, reply_to),
                );
            }
            Audience::Broadcast { except, min_rank } => {
                let users = self.store.iterate_users(UserOrder::Unordered).await?;
                for user in users.iter().filter(|u| u.is_joined()) {
                    if *except == Some(user.id) && !user.debug_enabled {
                        continue;
                    }
                    if min_rank.is_some_and(|rank| user.rank < rank) {
                        continue;
                    }
                    if let Some(msid) = msid {
                        self.cache.save_mapping(user.id, msid, Delivered::Pending);
                    }
                    self.queue.put(
                        priority_for(Some(user), now),
                        DeliveryItem::send(user.id, msid, message.clone(), reply_to),
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        msid: MessageId,
        _acting: Option<UserId>,
    ) -> Result<(), ApplicationError> {
        let cancelled = self.queue.delete(|item| item.msid == Some(msid));
        let mut deleted = 0;
        for (recipient, delivered) in self.cache.copies(msid) {
            if let Delivered::Sent(transport_id) = delivered {
                self.queue.put(
                    Self::FOLLOW_UP_PRIORITY,
                    DeliveryItem {
                        recipient,
                        msid: None,
                        action: DeliveryAction::Delete { transport_id },
                    },
                );
                deleted += 1;
            }
        }
        self.cache.delete_mappings(msid);
        debug!(msid = %msid, cancelled, deleted, "Message deletion queued");
        Ok(())
    }

    async fn stop_invoked(
        &self,
        user: UserId,
        cascade: Option<&HashSet<MessageId>>,
    ) -> Result<(), ApplicationError> {
        let cancelled = self.queue.delete(|item| {
            item.recipient == user
                || match (cascade, item.msid) {
                    (Some(authored), Some(msid)) => authored.contains(&msid),
                    _ => false,
                }
        });
        debug!(user_id = %user, cancelled, "Pending deliveries cancelled");
        Ok(())
    }

    async fn edit(&self, msid: MessageId, message: Arc<Outbound>) -> Result<(), ApplicationError> {
        // 作者自己的副本已由传输层修改
        let author = self.cache.get(msid).and_then(|cm| cm.user_id);
        for (recipient, delivered) in self.cache.copies(msid) {
            if Some(recipient) == author {
                continue;
            }
            if let Delivered::Sent(transport_id) = delivered {
                self.queue.put(
                    Self::FOLLOW_UP_PRIORITY,
                    DeliveryItem {
                        recipient,
                        msid: Some(msid),
                        action: DeliveryAction::Edit {
                            transport_id,
                            message: message.clone(),
                        },
                    },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryUserStore;
    use domain::{TransportMessageId, User};
    use time::macros::datetime;

    struct Fixture {
        store: Arc<MemoryUserStore>,
        cache: Arc<IdentityCache>,
        queue: Arc<DeliveryQueue>,
        dispatcher: Dispatcher,
    }

    async fn fixture(users: &[(i64, Rank)]) -> Fixture {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00 UTC)));
        let store = Arc::new(MemoryUserStore::new());
        for (id, rank) in users {
            let mut user = User::register(UserId(*id), "u", "0".into(), clock.now());
            user.rank = *rank;
            store.add_user(user).await.unwrap();
        }
        let cache = Arc::new(IdentityCache::new(clock.clone(), time::Duration::hours(36)));
        let queue = Arc::new(DeliveryQueue::new());
        let receiver = QueueReceiver::new(store.clone(), cache.clone(), queue.clone(), clock);
        let dispatcher = Dispatcher::new(cache.clone()).with_receiver(Arc::new(receiver));
        Fixture {
            store,
            cache,
            queue,
            dispatcher,
        }
    }

    fn drain(queue: &DeliveryQueue) -> Vec<DeliveryItem> {
        std::iter::from_fn(|| queue.try_get()).collect()
    }

    #[tokio::test]
    async fn test_unicast_system_reply_has_no_msid() {
        let f = fixture(&[(1, Rank::User)]).await;
        let msid = f
            .dispatcher
            .system(Reply::Success, Audience::User(UserId(1)), None)
            .await;
        assert!(msid.is_none());
        let items = drain(&f.queue);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].msid, None);
    }

    #[tokio::test]
    async fn test_broadcast_skips_except_and_writes_pending() {
        let f = fixture(&[(1, Rank::User), (2, Rank::User), (3, Rank::Mod)]).await;
        let msid = f
            .dispatcher
            .system(Reply::custom("hi"), Audience::everyone_except(UserId(1)), None)
            .await
            .unwrap();

        let recipients: Vec<UserId> = drain(&f.queue).iter().map(|i| i.recipient).collect();
        assert_eq!(recipients.len(), 2);
        assert!(!recipients.contains(&UserId(1)));
        assert_eq!(
            f.cache.lookup_transport_id(UserId(2), msid),
            Some(Delivered::Pending)
        );
        assert_eq!(f.cache.lookup_transport_id(UserId(1), msid), None);
    }

    #[tokio::test]
    async fn test_debug_mode_author_receives_own_broadcast() {
        let f = fixture(&[(1, Rank::User), (2, Rank::User)]).await;
        let mut author = f.store.get_user(UserId(1)).await.unwrap().unwrap();
        author.debug_enabled = true;
        f.store.set_user(author).await.unwrap();

        f.dispatcher
            .system(Reply::custom("hi"), Audience::everyone_except(UserId(1)), None)
            .await;
        assert_eq!(drain(&f.queue).len(), 2);
    }

    #[tokio::test]
    async fn test_min_rank_limits_broadcast() {
        let f = fixture(&[(1, Rank::User), (2, Rank::Mod), (3, Rank::Admin)]).await;
        let msid = f.cache.assign(Some(UserId(1)));
        let message = RelayedMessage {
            content: domain::MessageContent::text("hello"),
            signature: None,
            edited: false,
        };
        f.dispatcher
            .relay(
                msid,
                message,
                Audience::Broadcast {
                    except: Some(UserId(1)),
                    min_rank: Some(Rank::Mod),
                },
                None,
            )
            .await;

        let recipients: Vec<UserId> = drain(&f.queue).iter().map(|i| i.recipient).collect();
        // 高等级用户优先
        assert_eq!(recipients, vec![UserId(3), UserId(2)]);
    }

    #[tokio::test]
    async fn test_delete_cancels_and_queues_deletes() {
        let f = fixture(&[(1, Rank::User), (2, Rank::User), (3, Rank::User)]).await;
        let msid = f
            .dispatcher
            .system(Reply::custom("x"), Audience::everyone_except(UserId(1)), None)
            .await
            .unwrap();
        // 假设 2 的副本已送达，3 的仍在队列中
        let _ = f.queue.delete(|item| item.recipient == UserId(2));
        f.cache
            .save_mapping(UserId(2), msid, Delivered::Sent(TransportMessageId(42)));

        f.dispatcher.delete(msid, Some(UserId(9))).await;

        let items = drain(&f.queue);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].recipient, UserId(2));
        assert!(matches!(
            items[0].action,
            DeliveryAction::Delete {
                transport_id: TransportMessageId(42)
            }
        ));
        assert!(f.cache.copies(msid).is_empty());
    }

    #[tokio::test]
    async fn test_stop_invoked_with_cascade() {
        let f = fixture(&[(1, Rank::User), (2, Rank::User), (3, Rank::User)]).await;
        let authored = f.cache.assign(Some(UserId(1)));
        let message = RelayedMessage {
            content: domain::MessageContent::text("spam"),
            signature: None,
            edited: false,
        };
        f.dispatcher
            .relay(authored, message, Audience::everyone_except(UserId(1)), None)
            .await;
        f.dispatcher
            .system(Reply::Success, Audience::User(UserId(1)), None)
            .await;
        f.dispatcher
            .system(Reply::custom("other"), Audience::everyone(), None)
            .await;
        assert_eq!(f.queue.len(), 2 + 1 + 3);

        f.dispatcher.stop_invoked(UserId(1), true).await;

        let items = drain(&f.queue);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.recipient != UserId(1)));
        assert!(items.iter().all(|i| i.msid != Some(authored)));
    }
}
