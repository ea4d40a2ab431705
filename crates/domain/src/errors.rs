//! 领域模型错误定义

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// tripcode 不符合 `name#secret` 格式
    #[error("invalid tripcode: {0}")]
    InvalidTripcode(&'static str),

    #[error("unknown rank: {0}")]
    UnknownRank(String),
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
