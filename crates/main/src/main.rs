//! 主应用程序入口
//!
//! 从标准输入读取事件，把投递结果写到标准输出，日志写到标准错误。

use std::sync::Arc;
use std::time::Duration;

use application::store::memory::MemoryUserStore;
use application::{EventLoop, ReconnectPolicy, RelayContext, RelayContextDependencies};
use config::RelayConfig;
use infrastructure::{AuditReceiver, ConsoleSource, ConsoleTransport, TransportIds};
use tracing_subscriber::EnvFilter;

/// 退出前等待投递队列清空的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load()?;

    // 初始化日志，RUST_LOG 优先于配置
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.filter.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ids = TransportIds::new();
    let mut deps = RelayContextDependencies::new(
        config,
        Arc::new(MemoryUserStore::new()),
        Arc::new(ConsoleTransport::stdout(ids.clone())),
    );
    deps.shadow_receivers.push(Arc::new(AuditReceiver::new()));

    let mut context = RelayContext::build(deps);
    let tasks = context.start();
    let event_loop = EventLoop::new(
        ConsoleSource::stdin(ids),
        context.handler(),
        ReconnectPolicy::default(),
    );

    tracing::info!("Relay started, reading events from stdin");
    let result = tokio::select! {
        result = event_loop.run() => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            signal.map_err(anyhow::Error::from)
        }
    };

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while !context.queue.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !context.queue.is_empty() {
        tracing::warn!(pending = context.queue.len(), "Exiting with undelivered messages");
    }
    for task in tasks {
        task.abort();
    }
    result
}
