use std::env;
use std::str::FromStr;
use std::time::Duration;

use leadflow_shared::DEFAULT_SCORE_CEILING;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_addr: String,
    /// How often the tenant list is re-read so new tenants start without a restart
    pub tenant_refresh_secs: u64,
    pub scheduler: SchedulerConfig,
    pub automation: AutomationConfig,
}

/// Background execution worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Identifies this process in `claimed_by`
    pub worker_id: String,
    pub poll_interval_secs: u64,
    pub batch_size: i64,
    /// How long a claim is honored before the sweep may take it back
    pub lease_secs: i64,
    pub max_attempts: i32,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub max_concurrency: usize,
    /// Lease reclamation, time-elapsed triggers, score refresh
    pub sweep_interval_secs: u64,
    pub time_trigger_lookback_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval_secs: 10,
            batch_size: 25,
            lease_secs: 300,
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            max_concurrency: 4,
            sweep_interval_secs: 300,
            time_trigger_lookback_hours: 24,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Delay before attempt `attempts + 1`: base * 2^(attempts - 1), capped
    pub fn backoff_for(&self, attempts: i32) -> chrono::Duration {
        let exponent = (attempts.max(1) - 1).min(30) as u32;
        let secs = self
            .backoff_base_secs
            .saturating_mul(2_i64.saturating_pow(exponent))
            .min(self.backoff_max_secs);
        chrono::Duration::seconds(secs)
    }
}

/// Knobs for the scoring, assignment and duplicate engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub score_ceiling: i32,
    pub duplicate_fuzzy_threshold: f64,
    pub duplicate_fuzzy_pool_limit: i64,
    pub auto_assign_on_create: bool,
    pub webhook_timeout_secs: u64,
    pub webhook_signing_secret: Option<String>,
    pub archive_after_days: Option<i64>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            score_ceiling: DEFAULT_SCORE_CEILING,
            duplicate_fuzzy_threshold: 0.75,
            duplicate_fuzzy_pool_limit: 500,
            auto_assign_on_create: true,
            webhook_timeout_secs: 10,
            webhook_signing_secret: None,
            archive_after_days: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn tenant_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.tenant_refresh_secs.max(1))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: env_or("SCHEDULER_ENABLED", scheduler_defaults.enabled),
            worker_id: env::var("SCHEDULER_WORKER_ID").unwrap_or(scheduler_defaults.worker_id),
            poll_interval_secs: env_or("SCHEDULER_POLL_INTERVAL_SECS", scheduler_defaults.poll_interval_secs),
            batch_size: env_or("SCHEDULER_BATCH_SIZE", scheduler_defaults.batch_size),
            lease_secs: env_or("SCHEDULER_LEASE_SECS", scheduler_defaults.lease_secs),
            max_attempts: env_or("SCHEDULER_MAX_ATTEMPTS", scheduler_defaults.max_attempts),
            backoff_base_secs: env_or("SCHEDULER_BACKOFF_BASE_SECS", scheduler_defaults.backoff_base_secs),
            backoff_max_secs: env_or("SCHEDULER_BACKOFF_MAX_SECS", scheduler_defaults.backoff_max_secs),
            max_concurrency: env_or("SCHEDULER_MAX_CONCURRENCY", scheduler_defaults.max_concurrency),
            sweep_interval_secs: env_or("SCHEDULER_SWEEP_INTERVAL_SECS", scheduler_defaults.sweep_interval_secs),
            time_trigger_lookback_hours: env_or(
                "SCHEDULER_TIME_TRIGGER_LOOKBACK_HOURS",
                scheduler_defaults.time_trigger_lookback_hours,
            ),
        };

        let automation_defaults = AutomationConfig::default();
        let automation = AutomationConfig {
            score_ceiling: env_or("SCORE_CEILING", automation_defaults.score_ceiling).max(0),
            duplicate_fuzzy_threshold: env_or(
                "DUPLICATE_FUZZY_THRESHOLD",
                automation_defaults.duplicate_fuzzy_threshold,
            )
            .clamp(0.0, 1.0),
            duplicate_fuzzy_pool_limit: env_or(
                "DUPLICATE_FUZZY_POOL_LIMIT",
                automation_defaults.duplicate_fuzzy_pool_limit,
            ),
            auto_assign_on_create: env_or("AUTO_ASSIGN_ON_CREATE", automation_defaults.auto_assign_on_create),
            webhook_timeout_secs: env_or("WEBHOOK_TIMEOUT_SECS", automation_defaults.webhook_timeout_secs),
            webhook_signing_secret: env::var("WEBHOOK_SIGNING_SECRET").ok().filter(|s| !s.is_empty()),
            archive_after_days: env::var("LEAD_ARCHIVE_AFTER_DAYS").ok().and_then(|v| v.parse().ok()),
        };

        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            server_addr: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            tenant_refresh_secs: env_or("TENANT_REFRESH_SECS", 60_u64).max(1),
            scheduler,
            automation,
        })
    }
}
