//! Configuration for the deployer.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use uuid::Uuid;

use crate::instance::InstanceSettings;
use crate::sshtunnel::TunnelRetryPolicy;

/// Deployer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for local state (the disk registry).
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// CPI executable. Required for commands that talk to the cloud.
    pub cpi_path: Option<PathBuf>,

    /// Sent to the CPI with every call.
    pub director_uuid: Uuid,

    pub agent_wait_timeout: Duration,
    pub agent_poll_delay: Duration,

    /// Agent ping bounds used while deleting instances.
    pub delete_ping_timeout: Duration,
    pub delete_ping_delay: Duration,

    /// At least one millisecond.
    pub jobs_poll_interval: Duration,

    pub tunnel_dial_max_tries: u32,
    pub tunnel_dial_delay: Duration,

    pub agent_task_poll_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let instance = InstanceSettings::default();
        let tunnel = TunnelRetryPolicy::default();

        Self {
            data_dir: PathBuf::from("/var/lib/dirboot"),
            log_level: "info".to_string(),
            cpi_path: None,
            director_uuid: Uuid::new_v4(),
            agent_wait_timeout: instance.agent_wait_timeout,
            agent_poll_delay: instance.agent_poll_delay,
            delete_ping_timeout: Duration::from_secs(10),
            delete_ping_delay: Duration::from_millis(500),
            jobs_poll_interval: instance.jobs_poll_interval,
            tunnel_dial_max_tries: tunnel.start_dial_max_tries,
            tunnel_dial_delay: tunnel.start_dial_delay,
            agent_task_poll_delay: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup. Durations are milliseconds.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse_var::<u64, _>(&lookup, key)?.map_or(default, Duration::from_millis))
        };

        let director_uuid = match lookup("DIRBOOT_DIRECTOR_UUID") {
            Some(raw) => Uuid::parse_str(&raw)
                .with_context(|| format!("Invalid DIRBOOT_DIRECTOR_UUID '{raw}'"))?,
            None => defaults.director_uuid,
        };

        let jobs_poll_interval = millis("DIRBOOT_JOBS_POLL_INTERVAL_MS", defaults.jobs_poll_interval)?;
        ensure!(
            !jobs_poll_interval.is_zero(),
            "Invalid value for DIRBOOT_JOBS_POLL_INTERVAL_MS: must be at least 1"
        );

        Ok(Self {
            data_dir: lookup("DIRBOOT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            log_level: lookup("DIRBOOT_LOG_LEVEL").unwrap_or(defaults.log_level),
            cpi_path: lookup("DIRBOOT_CPI_PATH").map(PathBuf::from),
            director_uuid,
            agent_wait_timeout: millis("DIRBOOT_AGENT_WAIT_TIMEOUT_MS", defaults.agent_wait_timeout)?,
            agent_poll_delay: millis("DIRBOOT_AGENT_POLL_DELAY_MS", defaults.agent_poll_delay)?,
            delete_ping_timeout: millis("DIRBOOT_DELETE_PING_TIMEOUT_MS", defaults.delete_ping_timeout)?,
            delete_ping_delay: millis("DIRBOOT_DELETE_PING_DELAY_MS", defaults.delete_ping_delay)?,
            jobs_poll_interval,
            tunnel_dial_max_tries: parse_var(&lookup, "DIRBOOT_TUNNEL_DIAL_MAX_TRIES")?
                .unwrap_or(defaults.tunnel_dial_max_tries),
            tunnel_dial_delay: millis("DIRBOOT_TUNNEL_DIAL_DELAY_MS", defaults.tunnel_dial_delay)?,
            agent_task_poll_delay: millis("DIRBOOT_AGENT_TASK_POLL_DELAY_MS", defaults.agent_task_poll_delay)?,
        })
    }

    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            agent_wait_timeout: self.agent_wait_timeout,
            agent_poll_delay: self.agent_poll_delay,
            jobs_poll_interval: self.jobs_poll_interval,
        }
    }

    pub fn tunnel_retry_policy(&self) -> TunnelRetryPolicy {
        TunnelRetryPolicy {
            start_dial_max_tries: self.tunnel_dial_max_tries,
            start_dial_delay: self.tunnel_dial_delay,
        }
    }

    /// SQLite file holding disk records.
    pub fn disk_registry_path(&self) -> PathBuf {
        self.data_dir.join("disks.db")
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {key}: '{raw}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dirboot"));
        assert_eq!(config.log_level, "info");
        assert!(config.cpi_path.is_none());
        assert_eq!(config.instance_settings(), InstanceSettings::default());
        assert_eq!(config.tunnel_retry_policy(), TunnelRetryPolicy::default());
        assert_eq!(config.delete_ping_timeout, Duration::from_secs(10));
        assert_eq!(config.disk_registry_path(), PathBuf::from("/var/lib/dirboot/disks.db"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DIRBOOT_DATA_DIR", "/tmp/dirboot"),
            ("DIRBOOT_CPI_PATH", "/usr/local/bin/cpi"),
            ("DIRBOOT_DIRECTOR_UUID", "6f7c1b0e-2d3a-4c5b-9e8f-0a1b2c3d4e5f"),
            ("DIRBOOT_AGENT_WAIT_TIMEOUT_MS", "60000"),
            ("DIRBOOT_JOBS_POLL_INTERVAL_MS", "250"),
            ("DIRBOOT_TUNNEL_DIAL_MAX_TRIES", "3"),
        ]))
        .unwrap();

        assert_eq!(config.cpi_path, Some(PathBuf::from("/usr/local/bin/cpi")));
        assert_eq!(
            config.director_uuid.to_string(),
            "6f7c1b0e-2d3a-4c5b-9e8f-0a1b2c3d4e5f"
        );

        let settings = config.instance_settings();
        assert_eq!(settings.agent_wait_timeout, Duration::from_secs(60));
        assert_eq!(settings.jobs_poll_interval, Duration::from_millis(250));
        assert_eq!(config.tunnel_retry_policy().start_dial_max_tries, 3);
        assert_eq!(config.disk_registry_path(), PathBuf::from("/tmp/dirboot/disks.db"));
    }

    #[rstest]
    #[case("DIRBOOT_AGENT_POLL_DELAY_MS", "soon")]
    #[case("DIRBOOT_TUNNEL_DIAL_MAX_TRIES", "-1")]
    #[case("DIRBOOT_JOBS_POLL_INTERVAL_MS", "0")]
    #[case("DIRBOOT_DIRECTOR_UUID", "not-a-uuid")]
    fn test_invalid_values(#[case] key: &str, #[case] value: &str) {
        let err = Config::from_lookup(lookup(&[(key, value)])).unwrap_err();
        assert!(err.to_string().contains(key), "{err}");
    }
}
