//! Configuration management

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::services::collector::CollectSettings;
use crate::services::executor::{ConflictPolicy, ExecutorSettings};
use crate::services::import_pipeline::ImportSettings;
use crate::services::phone::PhoneRule;
use crate::services::retry::RetryPolicy;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// `postgres` or `memory`
    pub store_backend: String,

    /// PostgreSQL connection string, required by the postgres backend
    pub database_url: Option<String>,

    /// Directory that import file references are resolved against
    pub upload_dir: PathBuf,

    pub import_batch_size: usize,
    pub collect_batch_size: usize,
    pub phone_min_digits: usize,
    pub phone_max_digits: usize,
    pub max_invalid_details: usize,

    pub worker_count: usize,
    pub job_queue_capacity: usize,
    pub conflict_policy: ConflictPolicy,
    pub lease_ttl_secs: u64,
    /// Always 0 under the reject policy
    pub lease_wait_secs: u64,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub max_retained_results: usize,
    /// Where job history is persisted; None keeps it in memory only
    pub job_history_file: Option<PathBuf>,
    /// Period of the automatic collection sweep; 0 disables it
    pub collect_sweep_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let nats_url = var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());

        let store_backend = var("STORE_BACKEND")
            .unwrap_or_else(|| "postgres".to_string())
            .trim()
            .to_ascii_lowercase();
        let database_url = var("DATABASE_URL");
        match store_backend.as_str() {
            "postgres" if database_url.is_none() => {
                anyhow::bail!("DATABASE_URL must be set when STORE_BACKEND is 'postgres'")
            }
            "postgres" | "memory" => {}
            other => anyhow::bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{}'", other),
        }

        let conflict_policy = match var("CONFLICT_POLICY") {
            Some(raw) => raw
                .parse::<ConflictPolicy>()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid CONFLICT_POLICY")?,
            None => ConflictPolicy::default(),
        };
        let lease_wait_secs = match conflict_policy {
            ConflictPolicy::Reject => 0,
            ConflictPolicy::Coalesce => parse_var(&var, "LEASE_WAIT_SECS", 30)?,
        };

        let job_history_file = match lookup("JOB_HISTORY_FILE") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from("logs/job-history.json")),
        };

        let config = Self {
            nats_url,
            store_backend,
            database_url,
            upload_dir: PathBuf::from(var("UPLOAD_DIR").unwrap_or_else(|| "uploads".to_string())),
            import_batch_size: parse_var(&var, "IMPORT_BATCH_SIZE", 500)?,
            collect_batch_size: parse_var(&var, "COLLECT_BATCH_SIZE", 500)?,
            phone_min_digits: parse_var(&var, "PHONE_MIN_DIGITS", 4)?,
            phone_max_digits: parse_var(&var, "PHONE_MAX_DIGITS", 15)?,
            max_invalid_details: parse_var(&var, "MAX_INVALID_DETAILS", 1000)?,
            worker_count: parse_var(&var, "WORKER_COUNT", 4)?,
            job_queue_capacity: parse_var(&var, "JOB_QUEUE_CAPACITY", 100)?,
            conflict_policy,
            lease_ttl_secs: parse_var(&var, "LEASE_TTL_SECS", 60)?,
            lease_wait_secs,
            retry_max_attempts: parse_var(&var, "RETRY_MAX_ATTEMPTS", 5)?,
            retry_base_delay_ms: parse_var(&var, "RETRY_BASE_DELAY_MS", 200)?,
            retry_max_delay_ms: parse_var(&var, "RETRY_MAX_DELAY_MS", 5000)?,
            max_retained_results: parse_var(&var, "MAX_RETAINED_RESULTS", 1000)?,
            job_history_file,
            collect_sweep_secs: parse_var(&var, "COLLECT_SWEEP_SECS", 0)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.import_batch_size == 0 || self.collect_batch_size == 0 {
            anyhow::bail!("IMPORT_BATCH_SIZE and COLLECT_BATCH_SIZE must be greater than 0");
        }
        if self.phone_min_digits == 0 || self.phone_min_digits > self.phone_max_digits {
            anyhow::bail!(
                "PHONE_MIN_DIGITS ({}) must be between 1 and PHONE_MAX_DIGITS ({})",
                self.phone_min_digits,
                self.phone_max_digits
            );
        }
        if self.worker_count == 0 || self.job_queue_capacity == 0 {
            anyhow::bail!("WORKER_COUNT and JOB_QUEUE_CAPACITY must be greater than 0");
        }
        if self.lease_ttl_secs == 0 {
            anyhow::bail!("LEASE_TTL_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        let retry = self.retry_policy();
        ExecutorSettings {
            worker_count: self.worker_count,
            queue_capacity: self.job_queue_capacity,
            conflict_policy: self.conflict_policy,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            lease_wait: Duration::from_secs(self.lease_wait_secs),
            lease_poll_interval: Duration::from_millis(500),
            max_retained_results: self.max_retained_results,
            upload_dir: self.upload_dir.clone(),
            history_file: self.job_history_file.clone(),
            retry,
            import: ImportSettings {
                batch_size: self.import_batch_size,
                phone_rule: PhoneRule {
                    min_digits: self.phone_min_digits,
                    max_digits: self.phone_max_digits,
                },
                max_invalid_details: self.max_invalid_details,
                retry,
            },
            collect: CollectSettings {
                batch_size: self.collect_batch_size,
                retry,
            },
        }
    }

    /// Sweep period, if the sweep is enabled
    pub fn collect_sweep(&self) -> Option<Duration> {
        (self.collect_sweep_secs > 0).then(|| Duration::from_secs(self.collect_sweep_secs))
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be a number, got '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_memory_backend() {
        let config = config_from(&[("STORE_BACKEND", "memory")]).unwrap();
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.import_batch_size, 500);
        assert_eq!(config.phone_min_digits, 4);
        assert_eq!(config.phone_max_digits, 15);
        assert_eq!(config.conflict_policy, ConflictPolicy::Coalesce);
        assert_eq!(config.lease_wait_secs, 30);
        assert!(config.collect_sweep().is_none());
        assert_eq!(config.job_history_file, Some(PathBuf::from("logs/job-history.json")));
    }

    #[test]
    fn test_postgres_backend_requires_database_url() {
        assert!(config_from(&[]).is_err());

        let config = config_from(&[("DATABASE_URL", "postgres://test")]).unwrap();
        assert_eq!(config.store_backend, "postgres");
        assert_eq!(config.database_url.as_deref(), Some("postgres://test"));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(config_from(&[("STORE_BACKEND", "redis")]).is_err());
    }

    #[test]
    fn test_reject_policy_never_waits_for_lease() {
        let config = config_from(&[
            ("STORE_BACKEND", "memory"),
            ("CONFLICT_POLICY", "reject"),
            ("LEASE_WAIT_SECS", "120"),
        ])
        .unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
        assert_eq!(config.lease_wait_secs, 0);
        assert_eq!(config.executor_settings().lease_wait, Duration::ZERO);
    }

    #[test]
    fn test_invalid_number_fails_with_key_name() {
        let err = config_from(&[("STORE_BACKEND", "memory"), ("IMPORT_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("IMPORT_BATCH_SIZE"));
    }

    #[test]
    fn test_phone_bounds_are_validated() {
        let result = config_from(&[
            ("STORE_BACKEND", "memory"),
            ("PHONE_MIN_DIGITS", "12"),
            ("PHONE_MAX_DIGITS", "8"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_executor_settings_carry_config() {
        let config = config_from(&[
            ("STORE_BACKEND", "memory"),
            ("UPLOAD_DIR", "/srv/uploads"),
            ("COLLECT_BATCH_SIZE", "250"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("JOB_HISTORY_FILE", ""),
            ("COLLECT_SWEEP_SECS", "60"),
        ])
        .unwrap();
        let settings = config.executor_settings();
        assert_eq!(settings.upload_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(settings.collect.batch_size, 250);
        assert_eq!(settings.import.retry.max_attempts, 3);
        assert!(settings.history_file.is_none());
        assert_eq!(config.collect_sweep(), Some(Duration::from_secs(60)));
    }
}
