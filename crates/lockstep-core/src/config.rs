//! Engine configuration (environment-style).
//!
//! | variable                              | default  |
//! |---------------------------------------|----------|
//! | `LOCKSTEP_WORKER_CONCURRENCY`         | 10       |
//! | `LOCKSTEP_BACKOFF_BASE_MS`            | 2000     |
//! | `LOCKSTEP_BACKOFF_CAP_MS`             | 30000    |
//! | `LOCKSTEP_JOB_TIMEOUT_MS`             | 600000   |
//! | `LOCKSTEP_CANCEL_GRACE_MS`            | 5000     |
//! | `LOCKSTEP_POOL_CAPACITY`              | 2        |
//! | `LOCKSTEP_SESSION_TTL_MS`             | 3600000  |
//! | `LOCKSTEP_SESSION_IDLE_TIMEOUT_MS`    | = TTL    |
//! | `LOCKSTEP_SESSION_ACQUIRE_TIMEOUT_MS` | 60000    |

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::app::backoff::BackoffPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be an unsigned integer, got {value:?}")]
    NotANumber { name: &'static str, value: String },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("backoff base ({base:?}) exceeds cap ({cap:?})")]
    BackoffBaseAboveCap { base: Duration, cap: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots (`C`).
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub job_timeout: Duration,
    /// How long a cancelled handler may keep running before it is aborted.
    pub cancel_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            backoff: BackoffPolicy::default(),
            job_timeout: Duration::from_secs(10 * 60),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of live sessions (`N`).
    pub capacity: usize,
    /// Maximum absolute age of a session.
    pub session_ttl: Duration,
    /// Maximum time a session may sit idle.
    pub idle_timeout: Duration,
    /// Bound on one cold create or one validation check.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(60 * 60);
        Self {
            capacity: 2,
            session_ttl: ttl,
            idle_timeout: ttl,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let num = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::NotANumber { name, value: raw }),
            }
        };
        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(num(name)?.map(Duration::from_millis).unwrap_or(default))
        };

        let session_ttl = millis("LOCKSTEP_SESSION_TTL_MS", defaults.pool.session_ttl)?;
        let config = Self {
            worker: WorkerConfig {
                concurrency: num("LOCKSTEP_WORKER_CONCURRENCY")?
                    .map(|n| n as usize)
                    .unwrap_or(defaults.worker.concurrency),
                backoff: BackoffPolicy::new(
                    millis("LOCKSTEP_BACKOFF_BASE_MS", defaults.worker.backoff.base_delay)?,
                    millis("LOCKSTEP_BACKOFF_CAP_MS", defaults.worker.backoff.max_delay)?,
                ),
                job_timeout: millis("LOCKSTEP_JOB_TIMEOUT_MS", defaults.worker.job_timeout)?,
                cancel_grace: millis("LOCKSTEP_CANCEL_GRACE_MS", defaults.worker.cancel_grace)?,
            },
            pool: PoolConfig {
                capacity: num("LOCKSTEP_POOL_CAPACITY")?
                    .map(|n| n as usize)
                    .unwrap_or(defaults.pool.capacity),
                session_ttl,
                idle_timeout: millis("LOCKSTEP_SESSION_IDLE_TIMEOUT_MS", session_ttl)?,
                acquire_timeout: millis(
                    "LOCKSTEP_SESSION_ACQUIRE_TIMEOUT_MS",
                    defaults.pool.acquire_timeout,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Zero("worker concurrency"));
        }
        if self.pool.capacity == 0 {
            return Err(ConfigError::Zero("pool capacity"));
        }
        let backoff = &self.worker.backoff;
        if backoff.base_delay > backoff.max_delay {
            return Err(ConfigError::BackoffBaseAboveCap {
                base: backoff.base_delay,
                cap: backoff.max_delay,
            });
        }
        // 正しさには影響しないが、セッションの作り直しが頻発する
        if self.worker.concurrency > self.pool.capacity {
            warn!(
                concurrency = self.worker.concurrency,
                capacity = self.pool.capacity,
                "worker concurrency exceeds session pool capacity; expect session churn"
            );
        }
        Ok(())
    }
}
