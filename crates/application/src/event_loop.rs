//! 入站事件循环
//!
//! 事件源通过一个显式的重连状态机驱动：
//! `Connecting` → `Streaming` → (`Backoff` → `Connecting`)*，
//! 临时错误退避后重连，致命错误直接停止并向调用方报告。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Audience, Dispatcher};
use crate::error::ApplicationError;
use crate::moderation::{Actor, Command, ModerationEngine};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("fatal source error: {0}")]
    Fatal(String),
}

/// 一条已解析的入站命令
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub actor: Actor,
    pub command: Command,
}

impl InboundEvent {
    pub fn new(actor: Actor, command: Command) -> Self {
        Self { actor, command }
    }
}

/// 入站事件源
#[async_trait]
pub trait EventSource: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// `Ok(None)` 表示事件源已正常关闭
    async fn next_event(&mut self) -> Result<Option<InboundEvent>, SourceError>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent);
}

/// 把命令交给审核引擎执行，并把回复私信给操作者
pub struct RelayHandler {
    engine: Arc<ModerationEngine>,
    dispatcher: Arc<Dispatcher>,
}

impl RelayHandler {
    pub fn new(engine: Arc<ModerationEngine>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { engine, dispatcher }
    }
}

#[async_trait]
impl EventHandler for RelayHandler {
    async fn handle(&self, event: InboundEvent) {
        let InboundEvent { actor, command } = event;
        let replies = self.engine.execute(&actor, command).await;
        for reply in replies {
            self.dispatcher
                .system(reply, Audience::User(actor.id), None)
                .await;
        }
    }
}

/// 重连退避策略
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// `None` 表示无限重试
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_at(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// 自上次成功连接以来的失败次数
    Connecting { failures: u32 },
    Streaming,
    Backoff { attempt: u32 },
}

pub struct EventLoop<S> {
    source: S,
    handler: Arc<dyn EventHandler>,
    policy: ReconnectPolicy,
}

impl<S: EventSource> EventLoop<S> {
    pub fn new(source: S, handler: Arc<dyn EventHandler>, policy: ReconnectPolicy) -> Self {
        Self {
            source,
            handler,
            policy,
        }
    }

    /// 运行直到事件源关闭或出现致命错误
    pub async fn run(mut self) -> Result<(), ApplicationError> {
        let mut state = LoopState::Connecting { failures: 0 };
        info!("Event loop started");

        loop {
            state = match state {
                LoopState::Connecting { failures } => match self.source.connect().await {
                    Ok(()) => {
                        info!("Event source connected");
                        LoopState::Streaming
                    }
                    Err(SourceError::Transient(reason)) => {
                        warn!(reason = %reason, failures = failures + 1, "Event source connect failed");
                        LoopState::Backoff {
                            attempt: failures + 1,
                        }
                    }
                    Err(err @ SourceError::Fatal(_)) => {
                        error!(error = %err, "Event source failed permanently");
                        return Err(err.into());
                    }
                },
                LoopState::Streaming => match self.source.next_event().await {
                    Ok(Some(event)) => {
                        debug!(user_id = %event.actor.id, command = event.command.name(), "Inbound event");
                        self.handler.handle(event).await;
                        LoopState::Streaming
                    }
                    Ok(None) => {
                        info!("Event source closed");
                        return Ok(());
                    }
                    Err(SourceError::Transient(reason)) => {
                        warn!(reason = %reason, "Event stream interrupted");
                        LoopState::Backoff { attempt: 1 }
                    }
                    Err(err @ SourceError::Fatal(_)) => {
                        error!(error = %err, "Event source failed permanently");
                        return Err(err.into());
                    }
                },
                LoopState::Backoff { attempt } => {
                    if self.policy.exhausted(attempt) {
                        error!(attempts = attempt - 1, "Event source reconnect attempts exhausted");
                        return Err(SourceError::Fatal("reconnect attempts exhausted".to_string()).into());
                    }
                    let delay = self.policy.delay_at(attempt);
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting event source");
                    sleep(delay).await;
                    LoopState::Connecting { failures: attempt }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use domain::UserId;

    #[derive(Default)]
    struct ScriptedSource {
        connects: VecDeque<Result<(), SourceError>>,
        events: VecDeque<Result<Option<InboundEvent>, SourceError>>,
        connect_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn connect(&mut self) -> Result<(), SourceError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.connects.pop_front().unwrap_or(Ok(()))
        }

        async fn next_event(&mut self) -> Result<Option<InboundEvent>, SourceError> {
            self.events.pop_front().unwrap_or(Ok(None))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(UserId, &'static str)>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: InboundEvent) {
            self.seen
                .lock()
                .unwrap()
                .push((event.actor.id, event.command.name()));
        }
    }

    fn event(id: i64, command: Command) -> Result<Option<InboundEvent>, SourceError> {
        Ok(Some(InboundEvent::new(Actor::new(id, None, "tester"), command)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_reconnects_after_transient_error() {
        let connect_calls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            connects: VecDeque::from([Ok(()), Err(SourceError::Transient("dns".into())), Ok(())]),
            events: VecDeque::from([
                event(1, Command::Join),
                Err(SourceError::Transient("reset".into())),
                event(2, Command::Leave),
                Ok(None),
            ]),
            connect_calls: connect_calls.clone(),
        };
        let handler = Arc::new(RecordingHandler::default());

        let result = EventLoop::new(source, handler.clone(), ReconnectPolicy::default())
            .run()
            .await;

        assert!(result.is_ok());
        assert_eq!(connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![(UserId(1), "join"), (UserId(2), "leave")]
        );
    }

    #[tokio::test]
    async fn test_fatal_error_stops_loop() {
        let source = ScriptedSource {
            events: VecDeque::from([Err(SourceError::Fatal("unauthorized".into())), event(1, Command::Join)]),
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::default());

        let result = EventLoop::new(source, handler.clone(), ReconnectPolicy::default())
            .run()
            .await;

        assert!(matches!(result, Err(ApplicationError::Source(SourceError::Fatal(_)))));
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_exhausted() {
        let connect_calls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            connects: (0..10)
                .map(|_| Err(SourceError::Transient("down".into())))
                .collect(),
            connect_calls: connect_calls.clone(),
            ..Default::default()
        };
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };

        let result = EventLoop::new(source, Arc::new(RecordingHandler::default()), policy)
            .run()
            .await;

        assert!(matches!(result, Err(ApplicationError::Source(SourceError::Fatal(_)))));
        // 首次连接加三次重连
        assert_eq!(connect_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        };
        assert_eq!(policy.delay_at(1), Duration::from_millis(500));
        assert_eq!(policy.delay_at(3), Duration::from_secs(2));
        assert_eq!(policy.delay_at(10), Duration::from_secs(5));
        assert_eq!(policy.delay_at(u32::MAX), Duration::from_secs(5));
    }
}
