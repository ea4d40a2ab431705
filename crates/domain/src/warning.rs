//! 警告与冷却策略
//!
//! 前 K 次警告使用显式表格，之后使用线性公式 `m·x + b`（单位：分钟）。

use serde::{Deserialize, Serialize};
use time::Duration;

/// 警告冷却时长策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningPolicy {
    /// 前 K 次警告对应的冷却分钟数
    pub cooldown_minutes: Vec<i64>,
    /// 线性部分斜率（分钟）
    pub linear_m: i64,
    /// 线性部分截距（分钟）
    pub linear_b: i64,
    /// 每次警告后的过期窗口
    pub expiry: Duration,
}

impl Default for WarningPolicy {
    fn default() -> Self {
        Self {
            // 1m, 5m, 25m, 2h, 12h, 3d
            cooldown_minutes: vec![1, 5, 25, 120, 720, 4320],
            // 之后依次为 7d, 10d, 13d, 16d ...
            linear_m: 4320,
            linear_b: 10080,
            expiry: Duration::hours(7 * 24),
        }
    }
}

impl WarningPolicy {
    /// 根据已有警告次数计算下一次冷却时长
    pub fn cooldown_for(&self, warnings: u32) -> Duration {
        let k = self.cooldown_minutes.len();
        let minutes = match self.cooldown_minutes.get(warnings as usize) {
            Some(&minutes) => minutes,
            None => {
                let x = i64::from(warnings) - k as i64;
                self.linear_m.saturating_mul(x).saturating_add(self.linear_b)
            }
        };
        Duration::minutes(minutes)
    }
}
