use std::time::Duration;

use async_trait::async_trait;
use domain::{Outbound, TransportMessageId, UserId};
use thiserror::Error;

/// 接收者永久不可达的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentReason {
    Blocked,
    Deactivated,
    InvalidPeer,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 全局限流，可携带服务端建议的等待时间
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient transport failure: {reason}")]
    Transient {
        reason: String,
        backoff_hint: Option<Duration>,
    },
    #[error("transport call timed out")]
    Timeout,
    #[error("recipient unreachable: {reason:?}")]
    Permanent { reason: PermanentReason },
    #[error("message not found")]
    NotFound,
}

impl TransportError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            backoff_hint: None,
        }
    }

    pub fn permanent(reason: PermanentReason) -> Self {
        Self::Permanent { reason }
    }
}

/// 传输层适配器契约，由投递 worker 独占调用
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        recipient: UserId,
        message: &Outbound,
        reply_to: Option<TransportMessageId>,
    ) -> Result<TransportMessageId, TransportError>;

    async fn delete(&self, recipient: UserId, id: TransportMessageId)
        -> Result<(), TransportError>;

    async fn edit(
        &self,
        recipient: UserId,
        id: TransportMessageId,
        message: &Outbound,
    ) -> Result<(), TransportError>;
}
