use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::DEFAULT_ORPHAN_GRACE_MS;
use crate::hostel::HostelSettings;
use crate::retry::RetryPolicy;

/// Server configuration, read once from `BUNKD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub hostel: HostelSettings,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Parsed value of `name`, or `default` when unset or unparsable.
fn parsed<T: FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let retry = RetryPolicy {
            max_attempts: parsed("BUNKD_RETRY_MAX_ATTEMPTS", 4),
            initial_delay: Duration::from_millis(parsed("BUNKD_RETRY_INITIAL_DELAY_MS", 20)),
            max_delay: Duration::from_millis(parsed("BUNKD_RETRY_MAX_DELAY_MS", 1000)),
            attempt_timeout: Duration::from_millis(parsed("BUNKD_STORE_TIMEOUT_MS", 2000)),
            ..RetryPolicy::default()
        };
        let hostel = HostelSettings {
            compact_threshold: parsed("BUNKD_COMPACT_THRESHOLD", 1000),
            unpaid_ttl: var("BUNKD_UNPAID_TTL_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs),
            reconcile_interval: Duration::from_secs(
                parsed("BUNKD_RECONCILE_INTERVAL_SECS", 60u64).max(1),
            ),
            orphan_grace: Duration::from_secs(parsed(
                "BUNKD_ORPHAN_GRACE_SECS",
                DEFAULT_ORPHAN_GRACE_MS as u64 / 1000,
            )),
            retry,
        };
        Self {
            port: parsed("BUNKD_PORT", 7878),
            bind: var("BUNKD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(var("BUNKD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: var("BUNKD_PASSWORD").unwrap_or_else(|| "bunkd".into()),
            max_connections: parsed("BUNKD_MAX_CONNECTIONS", 256),
            metrics_port: var("BUNKD_METRICS_PORT").and_then(|s| s.parse().ok()),
            hostel,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
