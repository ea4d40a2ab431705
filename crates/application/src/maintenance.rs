//! 周期性维护任务：反垃圾衰减、警告过期、缓存淘汰

use std::sync::Arc;
use std::time::Duration;

use config::RelayConfig;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::IdentityCache;
use crate::delivery::DeliveryQueue;
use crate::moderation::ModerationEngine;
use crate::spam_gate::SpamGate;

/// 维护任务的执行间隔
#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    pub spam_tick: Duration,
    pub warning_sweep: Duration,
    pub cache_sweep: Duration,
}

impl From<&RelayConfig> for MaintenanceIntervals {
    fn from(config: &RelayConfig) -> Self {
        Self {
            spam_tick: config.spam.decay_interval(),
            warning_sweep: config.warnings.sweep_interval(),
            cache_sweep: config.cache.sweep_interval(),
        }
    }
}

pub struct Maintenance {
    engine: Arc<ModerationEngine>,
    spam_gate: Arc<SpamGate>,
    cache: Arc<IdentityCache>,
    queue: Arc<DeliveryQueue>,
    intervals: MaintenanceIntervals,
}

impl Maintenance {
    pub fn new(
        engine: Arc<ModerationEngine>,
        spam_gate: Arc<SpamGate>,
        cache: Arc<IdentityCache>,
        queue: Arc<DeliveryQueue>,
        intervals: MaintenanceIntervals,
    ) -> Self {
        Self {
            engine,
            spam_gate,
            cache,
            queue,
            intervals,
        }
    }

    /// 淘汰过期缓存，并从队列中剔除引用这些消息的条目
    pub fn expire_cache(&self) -> usize {
        let expired = self.cache.expire();
        if expired.is_empty() {
            return 0;
        }
        let pruned = self
            .queue
            .delete(|item| item.msid.is_some_and(|msid| expired.contains(&msid)));
        info!(expired = expired.len(), pruned, "Expired cached messages");
        expired.len()
    }

    /// 启动全部维护任务
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let this = Arc::new(self);
        let mut handles = Vec::with_capacity(3);

        let spam = this.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = every(spam.intervals.spam_tick);
            loop {
                ticker.tick().await;
                spam.spam_gate.tick();
            }
        }));

        let warnings = this.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = every(warnings.intervals.warning_sweep);
            loop {
                ticker.tick().await;
                warnings.engine.expire_warnings().await;
            }
        }));

        let cache = this;
        handles.push(tokio::spawn(async move {
            let mut ticker = every(cache.intervals.cache_sweep);
            loop {
                ticker.tick().await;
                cache.expire_cache();
            }
        }));

        debug!("Maintenance tasks started");
        handles
    }
}

/// 首次触发在一个完整周期之后
fn every(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::delivery::DeliveryItem;
    use crate::dispatcher::Dispatcher;
    use crate::moderation::{ModerationDependencies, ModerationSettings};
    use crate::store::memory::MemoryUserStore;
    use domain::{Outbound, Reply, UserId};
    use time::macros::datetime;

    fn fixture() -> (Arc<ManualClock>, Maintenance) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 0:00 UTC)));
        let cache = Arc::new(IdentityCache::new(clock.clone(), time::Duration::hours(36)));
        let spam_gate = Arc::new(SpamGate::new(3000, 6000, 1000));
        let queue = Arc::new(DeliveryQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(cache.clone()));
        let engine = Arc::new(ModerationEngine::new(ModerationDependencies {
            store: Arc::new(MemoryUserStore::new()),
            cache: cache.clone(),
            spam_gate: spam_gate.clone(),
            dispatcher,
            clock: clock.clone() as Arc<dyn Clock>,
            settings: ModerationSettings::default(),
        }));
        let intervals = MaintenanceIntervals::from(&RelayConfig::default());
        (clock, Maintenance::new(engine, spam_gate, cache, queue, intervals))
    }

    #[test]
    fn test_expire_cache_prunes_queue() {
        let (clock, maintenance) = fixture();
        let old = maintenance.cache.assign(Some(UserId(1)));
        let message = Arc::new(Outbound::System(Reply::KarmaNotification));
        maintenance.queue.put(1, DeliveryItem::send(UserId(2), Some(old), message.clone(), None));
        maintenance.queue.put(1, DeliveryItem::send(UserId(2), None, message.clone(), None));

        clock.advance(time::Duration::hours(37));
        let fresh = maintenance.cache.assign(Some(UserId(1)));
        maintenance.queue.put(1, DeliveryItem::send(UserId(3), Some(fresh), message, None));

        assert_eq!(maintenance.expire_cache(), 1);
        assert!(maintenance.cache.get(old).is_none());
        assert!(maintenance.cache.get(fresh).is_some());
        assert_eq!(maintenance.queue.len(), 2);
    }

    #[test]
    fn test_expire_cache_noop_when_fresh() {
        let (_clock, maintenance) = fixture();
        maintenance.cache.assign(None);
        assert_eq!(maintenance.expire_cache(), 0);
        assert_eq!(maintenance.cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spam_decay_runs_on_interval() {
        let (_clock, maintenance) = fixture();
        let gate = maintenance.spam_gate.clone();
        assert!(gate.admit(UserId(1), 2500));
        let handles = maintenance.spawn();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(gate.score(UserId(1)), Some(1500));

        for handle in handles {
            handle.abort();
        }
    }
}
