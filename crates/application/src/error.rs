use domain::DomainError;
use thiserror::Error;

use crate::event_loop::SourceError;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("event source error: {0}")]
    Source(#[from] SourceError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }
}
