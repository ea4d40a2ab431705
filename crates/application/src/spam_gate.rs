use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use config::SpamConfig;
use domain::UserId;
use tracing::debug;

/// 反垃圾闸门
/// 每个用户一个随时间衰减的分值，超过上限后进入冷却期
pub struct SpamGate {
    /// 硬上限
    limit: u32,
    /// 越限时写入的哨兵值
    limit_hit: u32,
    /// 每次衰减的步长
    decay_step: u32,
    scores: Mutex<HashMap<UserId, u32>>,
}

impl SpamGate {
    pub fn new(limit: u32, limit_hit: u32, decay_step: u32) -> Self {
        Self {
            limit,
            limit_hit,
            decay_step,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SpamConfig) -> Self {
        Self::new(config.limit, config.limit_hit, config.decay_step)
    }

    fn scores(&self) -> MutexGuard<'_, HashMap<UserId, u32>> {
        self.scores.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 尝试为用户记入一条消息的分值，返回是否放行
    pub fn admit(&self, user_id: UserId, cost: u32) -> bool {
        let mut scores = self.scores();
        let score = scores.get(&user_id).copied().unwrap_or(0);
        let next = score.saturating_add(cost);

        if score > self.limit {
            return false;
        }
        if next > self.limit {
            scores.insert(user_id, self.limit_hit);
            debug!(user_id = %user_id, score = next, "Spam limit hit");
            return next <= self.limit_hit;
        }
        scores.insert(user_id, next);
        true
    }

    /// 定时衰减，归零的条目被移除
    pub fn tick(&self) {
        let step = self.decay_step;
        self.scores().retain(|_, score| {
            *score = score.saturating_sub(step);
            *score > 0
        });
    }

    pub fn score(&self, user_id: UserId) -> Option<u32> {
        self.scores().get(&user_id).copied()
    }

    pub fn tracked_users(&self) -> usize {
        self.scores().len()
    }
}
