//! 投递队列与投递 worker
//!
//! 队列按优先级出队（数值越小越优先），同优先级保持入队顺序。
//! 只有一个消费者，从而保证同一接收者的消息按入队顺序送达。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use config::DeliveryConfig;
use domain::{MessageId, Outbound, Rank, Timestamp, TransportMessageId, User, UserId};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::{Delivered, IdentityCache};
use crate::transport::{Transport, TransportError};

/// 投递动作
#[derive(Debug, Clone)]
pub enum DeliveryAction {
    Send {
        message: Arc<Outbound>,
        /// 被回复消息的 msid，在投递时才解析为接收者侧的传输层ID
        reply_to: Option<MessageId>,
    },
    Delete {
        transport_id: TransportMessageId,
    },
    Edit {
        transport_id: TransportMessageId,
        message: Arc<Outbound>,
    },
}

#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub recipient: UserId,
    pub msid: Option<MessageId>,
    pub action: DeliveryAction,
}

impl DeliveryItem {
    pub fn send(
        recipient: UserId,
        msid: Option<MessageId>,
        message: Arc<Outbound>,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            recipient,
            msid,
            action: DeliveryAction::Send { message, reply_to },
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(self.action, DeliveryAction::Send { .. })
    }
}

/// 计算接收者的投递优先级；未知用户按最低等级、零不活跃处理
pub fn priority_for(user: Option<&User>, now: Timestamp) -> u64 {
    match user {
        Some(user) => user.message_priority(now),
        None => (Rank::MAX.value() as u64) << 16,
    }
}

struct Entry {
    priority: u64,
    seq: u64,
    item: DeliveryItem,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap 是大顶堆，这里反转使最小的 (priority, seq) 先出队
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// 优先级投递队列，生产者永不阻塞
#[derive(Default)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, priority: u64, item: DeliveryItem) {
        {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry {
                priority,
                seq,
                item,
            });
        }
        self.notify.notify_one();
    }

    pub fn try_get(&self) -> Option<DeliveryItem> {
        self.state().heap.pop().map(|entry| entry.item)
    }

    /// 阻塞直到有可用条目
    pub async fn get(&self) -> DeliveryItem {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// 移除尚未派发的匹配条目，返回移除数量
    pub fn delete<F>(&self, predicate: F) -> usize
    where
        F: Fn(&DeliveryItem) -> bool,
    {
        let mut state = self.state();
        let before = state.heap.len();
        state.heap.retain(|entry| !predicate(&entry.item));
        before - state.heap.len()
    }

    pub fn len(&self) -> usize {
        self.state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub send_timeout: Duration,
    pub max_attempts: u32,
    pub max_rate_limit_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub pause_after_send: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            max_attempts: config.max_attempts,
            max_rate_limit_attempts: config.max_rate_limit_attempts,
            backoff: config.backoff(),
            max_backoff: config.max_backoff(),
            pause_after_send: config.pause_after_send(),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.backoff).min(self.max_backoff)
    }
}

/// 单个条目的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// 重试耗尽或目标消息已不存在
    Dropped,
    /// 接收者永久不可达，已上报会话终止
    Unreachable,
}

pub struct DeliveryWorker {
    queue: Arc<DeliveryQueue>,
    cache: Arc<IdentityCache>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    unreachable: mpsc::UnboundedSender<UserId>,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        cache: Arc<IdentityCache>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        unreachable: mpsc::UnboundedSender<UserId>,
    ) -> Self {
        Self {
            queue,
            cache,
            transport,
            policy,
            unreachable,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!("Delivery worker started");
        loop {
            let item = self.queue.get().await;
            self.process(item).await;
        }
    }

    pub async fn process(&self, item: DeliveryItem) -> DeliveryOutcome {
        let mut attempts = 0u32;
        let mut rate_limited = 0u32;

        loop {
            let result = match timeout(self.policy.send_timeout, self.execute(&item)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            let delay = match result {
                Ok(()) => {
                    if item.is_send() && !self.policy.pause_after_send.is_zero() {
                        sleep(self.policy.pause_after_send).await;
                    }
                    return DeliveryOutcome::Delivered;
                }
                Err(TransportError::NotFound) => {
                    if matches!(item.action, DeliveryAction::Delete { .. }) {
                        return DeliveryOutcome::Delivered;
                    }
                    debug!(recipient = %item.recipient, "Target message no longer exists");
                    return DeliveryOutcome::Dropped;
                }
                Err(TransportError::Permanent { reason }) => {
                    warn!(recipient = %item.recipient, ?reason, "Recipient unreachable, ending session");
                    let _ = self.unreachable.send(item.recipient);
                    return DeliveryOutcome::Unreachable;
                }
                Err(TransportError::RateLimited { retry_after }) => {
                    rate_limited += 1;
                    if rate_limited >= self.policy.max_rate_limit_attempts {
                        warn!(recipient = %item.recipient, attempts = rate_limited, "Rate limited too often, dropping delivery");
                        return DeliveryOutcome::Dropped;
                    }
                    let delay = self.policy.delay(retry_after);
                    warn!(delay_ms = delay.as_millis() as u64, "API rate limit hit, waiting");
                    delay
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        warn!(recipient = %item.recipient, error = %err, attempts, "Giving up on delivery");
                        return DeliveryOutcome::Dropped;
                    }
                    let hint = match &err {
                        TransportError::Transient { backoff_hint, .. } => *backoff_hint,
                        _ => None,
                    };
                    debug!(recipient = %item.recipient, error = %err, attempts, "Retrying delivery");
                    self.policy.delay(hint)
                }
            };
            sleep(delay).await;
        }
    }

    async fn execute(&self, item: &DeliveryItem) -> Result<(), TransportError> {
        match &item.action {
            DeliveryAction::Send { message, reply_to } => {
                let reply_to = reply_to
                    .and_then(|msid| self.cache.lookup_transport_id(item.recipient, msid))
                    .and_then(Delivered::sent);
                let id = self
                    .transport
                    .send(item.recipient, message, reply_to)
                    .await?;
                if let Some(msid) = item.msid {
                    self.cache
                        .save_mapping(item.recipient, msid, Delivered::Sent(id));
                }
                Ok(())
            }
            DeliveryAction::Delete { transport_id } => {
                self.transport.delete(item.recipient, *transport_id).await
            }
            DeliveryAction::Edit {
                transport_id,
                message,
            } => {
                self.transport
                    .edit(item.recipient, *transport_id, message)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::transport::{MockTransport, PermanentReason};
    use domain::Reply;
    use mockall::predicate::eq;
    use time::macros::datetime;

    fn item(recipient: i64, msid: Option<u64>) -> DeliveryItem {
        DeliveryItem::send(
            UserId(recipient),
            msid.map(MessageId),
            Arc::new(Outbound::System(Reply::Success)),
            None,
        )
    }

    fn worker(transport: MockTransport) -> (DeliveryWorker, Arc<IdentityCache>, mpsc::UnboundedReceiver<UserId>) {
        let cache = Arc::new(IdentityCache::new(
            Arc::new(SystemClock),
            time::Duration::hours(36),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            pause_after_send: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let worker = DeliveryWorker::new(
            Arc::new(DeliveryQueue::new()),
            cache.clone(),
            Arc::new(transport),
            policy,
            tx,
        );
        (worker, cache, rx)
    }

    #[test]
    fn test_queue_orders_by_priority_then_insertion() {
        let queue = DeliveryQueue::new();
        queue.put(5, item(1, None));
        queue.put(1, item(2, None));
        queue.put(5, item(3, None));
        queue.put(1, item(4, None));
        queue.put(3, item(5, None));

        let order: Vec<i64> = std::iter::from_fn(|| queue.try_get())
            .map(|i| i.recipient.0)
            .collect();
        assert_eq!(order, vec![2, 4, 5, 1, 3]);
    }

    #[test]
    fn test_equal_priority_batch_is_fifo() {
        let queue = DeliveryQueue::new();
        for i in 0..100 {
            queue.put(7, item(i, None));
        }
        for i in 0..100 {
            assert_eq!(queue.try_get().unwrap().recipient, UserId(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_delete_by_predicate() {
        let queue = DeliveryQueue::new();
        queue.put(1, item(1, Some(10)));
        queue.put(1, item(2, Some(10)));
        queue.put(1, item(3, Some(11)));

        assert_eq!(queue.delete(|i| i.msid == Some(MessageId(10))), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_get().unwrap().recipient, UserId(3));
    }

    #[test]
    fn test_priority_for_unknown_and_known_users() {
        let now = datetime!(2024-01-01 12:00 UTC);
        let mut admin = User::register(UserId(1), "a", "0".into(), now);
        admin.rank = Rank::Admin;
        let regular = User::register(UserId(2), "b", "0".into(), now);

        assert_eq!(priority_for(None, now), priority_for(Some(&regular), now));
        assert!(priority_for(Some(&admin), now) < priority_for(Some(&regular), now));
    }

    #[tokio::test]
    async fn test_get_wakes_on_put() {
        let queue = Arc::new(DeliveryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.put(0, item(9, None));
        let got = consumer.await.unwrap();
        assert_eq!(got.recipient, UserId(9));
    }

    #[tokio::test]
    async fn test_successful_send_resolves_mapping() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .with(eq(UserId(2)), mockall::predicate::always(), eq(None::<TransportMessageId>))
            .times(1)
            .returning(|_, _, _| Ok(TransportMessageId(500)));
        let (worker, cache, _rx) = worker(transport);

        let msid = cache.assign(Some(UserId(1)));
        cache.save_mapping(UserId(2), msid, Delivered::Pending);

        let outcome = worker.process(item(2, Some(msid.0))).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(
            cache.lookup_transport_id(UserId(2), msid),
            Some(Delivered::Sent(TransportMessageId(500)))
        );
        assert_eq!(cache.lookup_msid(UserId(2), TransportMessageId(500)), Some(msid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_then_dropped() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(5)
            .returning(|_, _, _| Err(TransportError::transient("flaky")));
        let (worker, _cache, mut rx) = worker(transport);

        let outcome = worker.process(item(2, None)).await;
        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_uses_separate_budget() {
        let mut transport = MockTransport::new();
        let mut calls = 0;
        transport.expect_send().times(8).returning(move |_, _, _| {
            calls += 1;
            if calls < 8 {
                Err(TransportError::RateLimited {
                    retry_after: Some(Duration::from_secs(2000)),
                })
            } else {
                Ok(TransportMessageId(1))
            }
        });
        let (worker, _cache, _rx) = worker(transport);

        let started = tokio::time::Instant::now();
        let outcome = worker.process(item(2, None)).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        // 服务端提示的等待时间被截断到 max_backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) * 7, "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(30) * 8, "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_permanent_failure_reports_recipient() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _, _| Err(TransportError::permanent(PermanentReason::Blocked)));
        let (worker, _cache, mut rx) = worker(transport);

        let outcome = worker.process(item(4, None)).await;
        assert_eq!(outcome, DeliveryOutcome::Unreachable);
        assert_eq!(rx.try_recv().unwrap(), UserId(4));
    }

    #[tokio::test]
    async fn test_delete_not_found_counts_as_success() {
        let mut transport = MockTransport::new();
        transport
            .expect_delete()
            .with(eq(UserId(3)), eq(TransportMessageId(8)))
            .times(1)
            .returning(|_, _| Err(TransportError::NotFound));
        let (worker, _cache, _rx) = worker(transport);

        let outcome = worker
            .process(DeliveryItem {
                recipient: UserId(3),
                msid: None,
                action: DeliveryAction::Delete {
                    transport_id: TransportMessageId(8),
                },
            })
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
    }
}
