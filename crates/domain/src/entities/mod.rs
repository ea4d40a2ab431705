//! 领域实体定义
//!
//! 包含系统的核心实体：用户、等级、缓存消息与全局文本配置。

pub mod cached_message;
pub mod rank;
pub mod system_config;
pub mod user;

// 重新导出核心实体
pub use cached_message::CachedMessage;
pub use rank::Rank;
pub use system_config::SystemConfig;
pub use user::{Membership, User};
