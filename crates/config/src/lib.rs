//! 统一配置中心
//!
//! 提供中继服务的全局配置管理，包括：
//! - 反垃圾计分
//! - 警告与冷却
//! - 消息缓存
//! - 投递重试
//! - 功能开关
//!
//! 加载顺序：默认值 -> 可选配置文件（RELAY_CONFIG_FILE）-> 环境变量（RELAY_*）。

use domain::{SpamCostTable, WarningPolicy};
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// 配置文件路径对应的环境变量
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG_FILE";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "RELAY_";

/// 全局中继配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    #[serde(default)]
    #[validate(nested)]
    pub spam: SpamConfig,
    #[serde(default)]
    #[validate(nested)]
    pub warnings: WarningsConfig,
    #[serde(default)]
    pub karma: KarmaConfig,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,
    #[serde(default)]
    #[validate(nested)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub features: FeaturesConfig,
    #[serde(default)]
    #[validate(nested)]
    pub log: LogConfig,
}

/// 反垃圾配置（分值为千分单位）
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SpamConfig {
    #[validate(range(min = 1))]
    pub limit: u32,
    /// 超限后写入的哨兵值，必须大于 limit
    #[validate(range(min = 1))]
    pub limit_hit: u32,
    #[validate(range(min = 1))]
    pub decay_step: u32,
    #[validate(range(min = 1))]
    pub decay_interval_secs: u64,
    #[serde(default)]
    pub costs: SpamCostTable,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            limit: 3000,
            limit_hit: 6000,
            decay_step: 1000,
            decay_interval_secs: 5,
            costs: SpamCostTable::default(),
        }
    }
}

impl SpamConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

/// 警告配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WarningsConfig {
    #[validate(length(min = 1))]
    pub cooldown_minutes: Vec<i64>,
    #[validate(range(min = 0))]
    pub linear_m: i64,
    #[validate(range(min = 0))]
    pub linear_b: i64,
    #[validate(range(min = 1))]
    pub expiry_hours: i64,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
}

impl Default for WarningsConfig {
    fn default() -> Self {
        let policy = WarningPolicy::default();
        Self {
            cooldown_minutes: policy.cooldown_minutes,
            linear_m: policy.linear_m,
            linear_b: policy.linear_b,
            expiry_hours: policy.expiry.whole_hours(),
            sweep_interval_secs: 15 * 60,
        }
    }
}

impl WarningsConfig {
    pub fn policy(&self) -> WarningPolicy {
        WarningPolicy {
            cooldown_minutes: self.cooldown_minutes.clone(),
            linear_m: self.linear_m,
            linear_b: self.linear_b,
            expiry: time::Duration::hours(self.expiry_hours),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// karma 增减配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KarmaConfig {
    pub plus_one: i64,
    pub warn_penalty: i64,
}

impl Default for KarmaConfig {
    fn default() -> Self {
        Self {
            plus_one: 1,
            warn_penalty: 10,
        }
    }
}

/// 消息缓存配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    #[validate(range(min = 1))]
    pub ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_hours: 36 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> time::Duration {
        time::Duration::hours(self.ttl_hours)
    }

    /// 过期清扫间隔为 TTL 的四分之一
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.unsigned_abs() * 3600 / 4)
    }
}

/// 投递重试配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeliveryConfig {
    #[validate(range(min = 1))]
    pub send_timeout_secs: u64,
    /// 单个接收者故障的最大尝试次数
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// 全局限流的最大尝试次数
    #[validate(range(min = 1))]
    pub max_rate_limit_attempts: u32,
    pub backoff_ms: u64,
    #[validate(range(min = 1))]
    pub max_backoff_secs: u64,
    pub pause_after_send_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 20,
            max_attempts: 5,
            max_rate_limit_attempts: 10,
            backoff_ms: 1000,
            max_backoff_secs: 30,
            pause_after_send_ms: 100,
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn pause_after_send(&self) -> Duration {
        Duration::from_millis(self.pause_after_send_ms)
    }
}

/// 功能开关
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FeaturesConfig {
    /// 仅允许白名单用户加入
    #[serde(default)]
    pub whitelist: bool,
    /// 封禁提示中展示的联系方式
    #[serde(default)]
    pub blacklist_contact: Option<String>,
    #[serde(default)]
    pub enable_expose: bool,
    #[serde(default)]
    pub allow_remove_command: bool,
    #[serde(default)]
    pub allow_edits: bool,
    /// 每条消息都必须带 tripcode 签名
    #[serde(default)]
    pub require_tripcode: bool,
    /// 新账号禁止发送媒体的时长
    #[serde(default)]
    #[validate(range(min = 1))]
    pub media_limit_hours: Option<i64>,
    #[validate(range(min = 0))]
    pub tripcode_interval_hours: i64,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            whitelist: false,
            blacklist_contact: None,
            enable_expose: false,
            allow_remove_command: true,
            allow_edits: false,
            require_tripcode: false,
            media_limit_hours: None,
            tripcode_interval_hours: 1,
        }
    }
}

impl FeaturesConfig {
    pub fn media_limit_period(&self) -> Option<time::Duration> {
        self.media_limit_hours.map(time::Duration::hours)
    }

    pub fn tripcode_interval(&self) -> time::Duration {
        time::Duration::hours(self.tripcode_interval_hours)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LogConfig {
    /// 默认的 EnvFilter 指令，RUST_LOG 优先
    #[validate(length(min = 1))]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl RelayConfig {
    /// 按优先级加载配置：默认值 -> 可选文件 -> 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(RelayConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let cfg: RelayConfig = fig.extract().map_err(Box::new)?;
        cfg.validate_all()?;
        Ok(cfg)
    }

    /// 字段校验加跨字段约束
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.spam.limit_hit <= self.spam.limit {
            return Err(ConfigError::Invalid(
                "spam.limit_hit must be greater than spam.limit".to_string(),
            ));
        }

        if self.delivery.max_rate_limit_attempts < self.delivery.max_attempts {
            return Err(ConfigError::Invalid(
                "delivery.max_rate_limit_attempts must not be lower than delivery.max_attempts"
                    .to_string(),
            ));
        }

        if self.warnings.cooldown_minutes.iter().any(|m| *m < 0) {
            return Err(ConfigError::Invalid(
                "warnings.cooldown_minutes must not contain negative values".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate_all().is_ok());
        assert_eq!(config.spam.limit, 3000);
        assert_eq!(config.cache.ttl(), time::Duration::hours(36));
        assert_eq!(config.cache.sweep_interval(), Duration::from_secs(9 * 3600));
        assert_eq!(config.warnings.policy(), WarningPolicy::default());
    }

    #[test]
    fn test_env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("RELAY_SPAM__LIMIT", "4000");
            jail.set_env("RELAY_SPAM__LIMIT_HIT", "8000");
            jail.set_env("RELAY_FEATURES__WHITELIST", "true");

            let config = RelayConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.spam.limit, 4000);
            assert_eq!(config.spam.limit_hit, 8000);
            assert!(config.features.whitelist);
            assert_eq!(config.delivery.max_attempts, 5);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "relay.toml",
                r#"
                [cache]
                ttl_hours = 12

                [features]
                blacklist_contact = "@admin"
                tripcode_interval_hours = 2
                "#,
            )?;
            jail.set_env(CONFIG_FILE_ENV, "relay.toml");
            jail.set_env("RELAY_CACHE__TTL_HOURS", "24");

            let config = RelayConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.cache.ttl_hours, 24);
            assert_eq!(config.features.blacklist_contact.as_deref(), Some("@admin"));
            assert_eq!(config.features.tripcode_interval(), time::Duration::hours(2));
            Ok(())
        });
    }

    #[test]
    fn test_cross_field_validation() {
        let mut config = RelayConfig::default();
        config.spam.limit_hit = config.spam.limit;
        let err = config.validate_all().unwrap_err();
        assert!(err.to_string().contains("limit_hit"));

        let mut config = RelayConfig::default();
        config.delivery.max_attempts = 0;
        assert!(matches!(
            config.validate_all(),
            Err(ConfigError::Validation(_))
        ));
    }
}
