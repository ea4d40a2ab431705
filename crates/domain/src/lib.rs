//! 匿名中继系统核心领域模型
//!
//! 包含用户、缓存消息、等级、tripcode 等核心实体，以及警告策略和类型化回复。

pub mod entities;
pub mod errors;
pub mod message;
pub mod reply;
pub mod tripcode;
pub mod value_objects;
pub mod warning;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use message::*;
pub use reply::*;
pub use tripcode::*;
pub use value_objects::*;
pub use warning::*;
