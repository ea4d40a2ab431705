//! 应用层实现。
//!
//! 身份缓存、反垃圾闸门、投递队列、分发器与审核引擎，
//! 以及把它们装配在一起的运行时上下文。存储与传输通过 trait 抽象，
//! 具体适配器由基础设施层提供。

pub mod cache;
pub mod clock;
pub mod context;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod maintenance;
pub mod moderation;
pub mod spam_gate;
pub mod store;
pub mod transport;

pub use cache::{Delivered, IdentityCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{RelayContext, RelayContextDependencies};
pub use delivery::{DeliveryAction, DeliveryItem, DeliveryOutcome, DeliveryQueue, DeliveryWorker, RetryPolicy};
pub use dispatcher::{Audience, Dispatcher, QueueReceiver, Receiver};
pub use error::ApplicationError;
pub use event_loop::{
    EventHandler, EventLoop, EventSource, InboundEvent, ReconnectPolicy, RelayHandler, SourceError,
};
pub use maintenance::{Maintenance, MaintenanceIntervals};
pub use moderation::{
    Actor, Command, EditRequest, MessageRef, ModerationDependencies, ModerationEngine,
    ModerationSettings, RelayRequest, Signing, Target,
};
pub use spam_gate::SpamGate;
pub use store::{AccessList, StoreError, UserLedger, UserOrder, UserStore};
pub use transport::{PermanentReason, Transport, TransportError};
