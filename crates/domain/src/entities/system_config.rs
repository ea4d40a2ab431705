use serde::{Deserialize, Serialize};

/// 持久化的全局文本配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// 欢迎语（motd），空串表示未设置
    pub motd: String,
    /// 帮助文本
    pub help: String,
}
