//! 基于文本流的传输层，用于本地运行与演示
//!
//! 每个投递动作写成一行：`-> <recipient> [#<id>] <text>`。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use application::{Transport, TransportError};
use async_trait::async_trait;
use domain::{Outbound, TransportMessageId, UserId};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::render::render_outbound;

/// 传输层消息ID分配器，在事件源与传输层之间共享
#[derive(Debug, Default)]
pub struct TransportIds {
    last: AtomicI64,
}

impl TransportIds {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn next(&self) -> TransportMessageId {
        TransportMessageId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

pub struct ConsoleTransport<W> {
    out: Mutex<W>,
    ids: Arc<TransportIds>,
}

impl ConsoleTransport<tokio::io::Stdout> {
    pub fn stdout(ids: Arc<TransportIds>) -> Self {
        Self::new(tokio::io::stdout(), ids)
    }
}

impl<W> ConsoleTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W, ids: Arc<TransportIds>) -> Self {
        Self {
            out: Mutex::new(out),
            ids,
        }
    }

    /// 取回底层输出（测试用）
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    async fn write_line(&self, line: String) -> Result<(), TransportError> {
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::transient(e.to_string()))?;
        out.write_all(b"\n")
            .await
            .map_err(|e| TransportError::transient(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| TransportError::transient(e.to_string()))
    }
}

#[async_trait]
impl<W> Transport for ConsoleTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(
        &self,
        recipient: UserId,
        message: &Outbound,
        reply_to: Option<TransportMessageId>,
    ) -> Result<TransportMessageId, TransportError> {
        let id = self.ids.next();
        let text = render_outbound(message);
        let line = match reply_to {
            Some(parent) => format!("-> {recipient} [#{id}] (re #{parent}) {text}"),
            None => format!("-> {recipient} [#{id}] {text}"),
        };
        self.write_line(line).await?;
        debug!(user_id = %recipient, transport_id = %id, "Console message written");
        Ok(id)
    }

    async fn delete(&self, recipient: UserId, id: TransportMessageId) -> Result<(), TransportError> {
        self.write_line(format!("-> {recipient} [#{id}] (deleted)")).await
    }

    async fn edit(
        &self,
        recipient: UserId,
        id: TransportMessageId,
        message: &Outbound,
    ) -> Result<(), TransportError> {
        let text = render_outbound(message);
        self.write_line(format!("-> {recipient} [#{id}] (edit) {text}"))
            .await
    }
}
