//! 运行时上下文：启动时一次性构建全部服务，不使用全局变量

use std::sync::Arc;

use config::RelayConfig;
use domain::UserId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::IdentityCache;
use crate::clock::{Clock, SystemClock};
use crate::delivery::{DeliveryQueue, DeliveryWorker, RetryPolicy};
use crate::dispatcher::{Dispatcher, QueueReceiver, Receiver};
use crate::event_loop::RelayHandler;
use crate::maintenance::{Maintenance, MaintenanceIntervals};
use crate::moderation::{ModerationDependencies, ModerationEngine, ModerationSettings};
use crate::spam_gate::SpamGate;
use crate::store::UserStore;
use crate::transport::Transport;

pub struct RelayContextDependencies {
    pub config: RelayConfig,
    pub store: Arc<dyn UserStore>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    /// 排在投递接收者之后的附加接收者，例如审计
    pub shadow_receivers: Vec<Arc<dyn Receiver>>,
}

impl RelayContextDependencies {
    pub fn new(config: RelayConfig, store: Arc<dyn UserStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            store,
            transport,
            clock: Arc::new(SystemClock),
            shadow_receivers: Vec::new(),
        }
    }
}

/// 尚未启动的后台任务
struct PendingTasks {
    worker: DeliveryWorker,
    unreachable: mpsc::UnboundedReceiver<UserId>,
    maintenance: Maintenance,
}

pub struct RelayContext {
    pub config: RelayConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn UserStore>,
    pub cache: Arc<IdentityCache>,
    pub spam_gate: Arc<SpamGate>,
    pub queue: Arc<DeliveryQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<ModerationEngine>,
    pending: Option<PendingTasks>,
}

impl RelayContext {
    pub fn build(deps: RelayContextDependencies) -> Self {
        let RelayContextDependencies {
            config,
            store,
            transport,
            clock,
            shadow_receivers,
        } = deps;

        let cache = Arc::new(IdentityCache::new(clock.clone(), config.cache.ttl()));
        let spam_gate = Arc::new(SpamGate::from_config(&config.spam));
        let queue = Arc::new(DeliveryQueue::new());

        let mut dispatcher = Dispatcher::new(cache.clone());
        dispatcher.register(Arc::new(QueueReceiver::new(
            store.clone(),
            cache.clone(),
            queue.clone(),
            clock.clone(),
        )));
        for receiver in shadow_receivers {
            dispatcher.register(receiver);
        }
        let dispatcher = Arc::new(dispatcher);

        let engine = Arc::new(ModerationEngine::new(ModerationDependencies {
            store: store.clone(),
            cache: cache.clone(),
            spam_gate: spam_gate.clone(),
            dispatcher: dispatcher.clone(),
            clock: clock.clone(),
            settings: ModerationSettings::from(&config),
        }));

        let (unreachable_tx, unreachable_rx) = mpsc::unbounded_channel();
        let worker = DeliveryWorker::new(
            queue.clone(),
            cache.clone(),
            transport,
            RetryPolicy::from(&config.delivery),
            unreachable_tx,
        );
        let maintenance = Maintenance::new(
            engine.clone(),
            spam_gate.clone(),
            cache.clone(),
            queue.clone(),
            MaintenanceIntervals::from(&config),
        );

        Self {
            config,
            clock,
            store,
            cache,
            spam_gate,
            queue,
            dispatcher,
            engine,
            pending: Some(PendingTasks {
                worker,
                unreachable: unreachable_rx,
                maintenance,
            }),
        }
    }

    /// 启动投递 worker、会话回收与维护任务，只在第一次调用时生效
    pub fn start(&mut self) -> Vec<JoinHandle<()>> {
        let Some(pending) = self.pending.take() else {
            warn!("Relay context already started");
            return Vec::new();
        };

        let mut handles = vec![
            pending.worker.spawn(),
            tokio::spawn(self.engine.clone().run_session_reaper(pending.unreachable)),
        ];
        handles.extend(pending.maintenance.spawn());
        info!(tasks = handles.len(), "Relay context started");
        handles
    }

    pub fn handler(&self) -> Arc<RelayHandler> {
        Arc::new(RelayHandler::new(self.engine.clone(), self.dispatcher.clone()))
    }
}
