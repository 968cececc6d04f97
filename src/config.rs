//! Configuration management for taskmarket.
//!
//! Configuration can be set via environment variables:
//! - `TASKMARKET_HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `TASKMARKET_PORT` - Optional. Server port. Defaults to `3000`.
//! - `TASKMARKET_STORE` - Optional. `sqlite` (default) or `memory`.
//! - `TASKMARKET_DATA_DIR` - Optional. Directory for the SQLite database. Defaults to `./data`.
//! - `TASKMARKET_MIN_REWARD` / `TASKMARKET_MAX_REWARD` - Optional. Per-completion reward bounds (minor units).
//! - `TASKMARKET_MIN_TARGET` / `TASKMARKET_MAX_TARGET` - Optional. Completion count bounds.
//! - `TASKMARKET_QUOTA_BRONZE` .. `TASKMARKET_QUOTA_PREMIUM` - Optional. Daily task-creation limits.
//! - `TASKMARKET_AUTO_APPROVE_SECS` - Optional. Default auto-approval window. Defaults to 24h.
//! - `TASKMARKET_APPEAL_WINDOW_SECS` - Optional. Appeal window after a rejection. Defaults to 24h.
//! - `TASKMARKET_CANCEL_PENALTY_BPS` - Optional. Forfeiture on cancellation. Defaults to `1000` (10%).
//! - `TASKMARKET_REWARD_LEVEL_POLICY` - Optional. `submission` (default) or `approval`.
//! - `TASKMARKET_SWEEP_ENABLED` - Optional. Run the auto-approval sweep. Defaults to `true`.
//! - `TASKMARKET_SWEEP_INTERVAL_SECS` / `TASKMARKET_SWEEP_BATCH` / `TASKMARKET_CLAIM_LEASE_SECS` - Optional.
//! - `TASKMARKET_VERIFIER_URL` - Optional. HTTP verifier for AUTO tasks.
//! - `TASKMARKET_VERIFIER_TIMEOUT_MS` - Optional. Defaults to `5000`.
//! - `TASKMARKET_NOTIFY_WEBHOOK_URL` - Optional. Webhook for user notifications.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::reward::Level;
use crate::store::StoreType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which executor level prices an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewardLevelPolicy {
    /// Level snapshotted at submission; used by moderators and the sweep alike.
    #[default]
    AtSubmission,
    /// Executor's level at the moment of approval.
    AtApproval,
}

impl RewardLevelPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "submission" | "at_submission" => Some(Self::AtSubmission),
            "approval" | "at_approval" => Some(Self::AtApproval),
            _ => None,
        }
    }
}

/// Daily task-creation limits per creator level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyQuotas {
    pub bronze: u32,
    pub silver: u32,
    pub gold: u32,
    pub premium: u32,
}

impl DailyQuotas {
    pub fn for_level(&self, level: Level) -> u32 {
        match level {
            Level::Bronze => self.bronze,
            Level::Silver => self.silver,
            Level::Gold => self.gold,
            Level::Premium => self.premium,
        }
    }
}

impl Default for DailyQuotas {
    fn default() -> Self {
        Self {
            bronze: 3,
            silver: 5,
            gold: 10,
            premium: 25,
        }
    }
}

/// Task-creation and moderation rules.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub min_reward: i64,
    pub max_reward: i64,
    pub min_target_count: u32,
    pub max_target_count: u32,
    pub daily_quotas: DailyQuotas,
    /// Used when a task does not set its own window.
    pub default_auto_approve_secs: i64,
    pub min_auto_approve_secs: i64,
    pub max_auto_approve_secs: i64,
    pub appeal_window_secs: i64,
    pub cancel_penalty_bps: i64,
    pub reward_level_policy: RewardLevelPolicy,
    pub verifier_timeout: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            min_reward: 1,
            max_reward: 1_000_000,
            min_target_count: 1,
            max_target_count: 10_000,
            daily_quotas: DailyQuotas::default(),
            default_auto_approve_secs: 24 * 3600,
            min_auto_approve_secs: 0,
            max_auto_approve_secs: 7 * 24 * 3600,
            appeal_window_secs: 24 * 3600,
            cancel_penalty_bps: 1000,
            reward_level_policy: RewardLevelPolicy::AtSubmission,
            verifier_timeout: Duration::from_millis(5000),
        }
    }
}

/// Auto-approval sweep settings.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: usize,
    /// How long a claim keeps other sweep instances away.
    pub claim_lease: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            batch_size: 50,
            claim_lease: Duration::from_secs(60),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Storage backend
    pub store_type: StoreType,

    /// Directory holding the SQLite database
    pub data_dir: PathBuf,

    pub market: MarketConfig,

    pub sweep: SweepConfig,

    /// HTTP verifier endpoint for AUTO tasks
    pub verifier_url: Option<url::Url>,

    /// Webhook receiving user notifications
    pub notify_webhook_url: Option<url::Url>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            store_type: StoreType::Memory,
            data_dir: PathBuf::from("./data"),
            market: MarketConfig::default(),
            sweep: SweepConfig::default(),
            verifier_url: None,
            notify_webhook_url: None,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_url(name: &str) -> Result<Option<url::Url>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => url::Url::parse(raw.trim())
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        _ => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but malformed
    /// or the resulting bounds are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let market_defaults = MarketConfig::default();
        let sweep_defaults = SweepConfig::default();
        let quota_defaults = DailyQuotas::default();

        let host = std::env::var("TASKMARKET_HOST").unwrap_or(defaults.host);
        let port = env_parse("TASKMARKET_PORT", defaults.port)?;

        let store_type = match std::env::var("TASKMARKET_STORE") {
            Ok(raw) => StoreType::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue("TASKMARKET_STORE".to_string(), raw.clone())
            })?,
            Err(_) => StoreType::Sqlite,
        };
        let data_dir = std::env::var("TASKMARKET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let reward_level_policy = match std::env::var("TASKMARKET_REWARD_LEVEL_POLICY") {
            Ok(raw) => RewardLevelPolicy::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue("TASKMARKET_REWARD_LEVEL_POLICY".to_string(), raw.clone())
            })?,
            Err(_) => market_defaults.reward_level_policy,
        };

        let market = MarketConfig {
            min_reward: env_parse("TASKMARKET_MIN_REWARD", market_defaults.min_reward)?,
            max_reward: env_parse("TASKMARKET_MAX_REWARD", market_defaults.max_reward)?,
            min_target_count: env_parse("TASKMARKET_MIN_TARGET", market_defaults.min_target_count)?,
            max_target_count: env_parse("TASKMARKET_MAX_TARGET", market_defaults.max_target_count)?,
            daily_quotas: DailyQuotas {
                bronze: env_parse("TASKMARKET_QUOTA_BRONZE", quota_defaults.bronze)?,
                silver: env_parse("TASKMARKET_QUOTA_SILVER", quota_defaults.silver)?,
                gold: env_parse("TASKMARKET_QUOTA_GOLD", quota_defaults.gold)?,
                premium: env_parse("TASKMARKET_QUOTA_PREMIUM", quota_defaults.premium)?,
            },
            default_auto_approve_secs: env_parse(
                "TASKMARKET_AUTO_APPROVE_SECS",
                market_defaults.default_auto_approve_secs,
            )?,
            min_auto_approve_secs: market_defaults.min_auto_approve_secs,
            max_auto_approve_secs: market_defaults.max_auto_approve_secs,
            appeal_window_secs: env_parse(
                "TASKMARKET_APPEAL_WINDOW_SECS",
                market_defaults.appeal_window_secs,
            )?,
            cancel_penalty_bps: env_parse(
                "TASKMARKET_CANCEL_PENALTY_BPS",
                market_defaults.cancel_penalty_bps,
            )?,
            reward_level_policy,
            verifier_timeout: Duration::from_millis(env_parse(
                "TASKMARKET_VERIFIER_TIMEOUT_MS",
                market_defaults.verifier_timeout.as_millis() as u64,
            )?),
        };

        let sweep = SweepConfig {
            enabled: crate::util::env_var_bool("TASKMARKET_SWEEP_ENABLED", sweep_defaults.enabled),
            interval: Duration::from_secs(env_parse(
                "TASKMARKET_SWEEP_INTERVAL_SECS",
                sweep_defaults.interval.as_secs(),
            )?),
            batch_size: env_parse("TASKMARKET_SWEEP_BATCH", sweep_defaults.batch_size)?,
            claim_lease: Duration::from_secs(env_parse(
                "TASKMARKET_CLAIM_LEASE_SECS",
                sweep_defaults.claim_lease.as_secs(),
            )?),
        };

        let config = Self {
            host,
            port,
            store_type,
            data_dir,
            market,
            sweep,
            verifier_url: env_url("TASKMARKET_VERIFIER_URL")?,
            notify_webhook_url: env_url("TASKMARKET_NOTIFY_WEBHOOK_URL")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the configured bounds are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.market;
        if m.min_reward <= 0 || m.min_reward > m.max_reward {
            return Err(ConfigError::InvalidValue(
                "TASKMARKET_MIN_REWARD".to_string(),
                format!("reward bounds {}..={} are invalid", m.min_reward, m.max_reward),
            ));
        }
        if m.min_target_count == 0 || m.min_target_count > m.max_target_count {
            return Err(ConfigError::InvalidValue(
                "TASKMARKET_MIN_TARGET".to_string(),
                format!(
                    "target bounds {}..={} are invalid",
                    m.min_target_count, m.max_target_count
                ),
            ));
        }
        if !(0..=10_000).contains(&m.cancel_penalty_bps) {
            return Err(ConfigError::InvalidValue(
                "TASKMARKET_CANCEL_PENALTY_BPS".to_string(),
                format!("{} is outside 0..=10000", m.cancel_penalty_bps),
            ));
        }
        if m.default_auto_approve_secs < m.min_auto_approve_secs
            || m.default_auto_approve_secs > m.max_auto_approve_secs
        {
            return Err(ConfigError::InvalidValue(
                "TASKMARKET_AUTO_APPROVE_SECS".to_string(),
                format!("{} is outside the allowed window", m.default_auto_approve_secs),
            ));
        }
        if self.sweep.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "TASKMARKET_SWEEP_BATCH".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
