//! 基础设施层实现。
//!
//! 提供基于文本流的传输层与事件源，以及影子审计接收器，
//! 实现应用层定义的 `Transport`、`EventSource` 与 `Receiver` 接口。

pub mod audit;
pub mod console;
pub mod render;
pub mod source;

pub use audit::{AuditReceiver, AuditSnapshot};
pub use console::{ConsoleTransport, TransportIds};
pub use render::{render_outbound, render_reply};
pub use source::{parse_line, ConsoleSource, ParseError};
