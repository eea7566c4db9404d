//! Deployment and installation manifest model.
//!
//! These are plain data types. Parsing and validation happen before the
//! deployer sees a manifest.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::CloudProperties;

/// Errors resolving manifest references.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Could not find job with name: {0}")]
    JobNotFound(String),

    #[error("Could not find persistent disk pool '{pool}' for job '{job}'")]
    DiskPoolNotFound { pool: String, job: String },
}

/// Deployment manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,

    #[serde(default)]
    pub jobs: Vec<Job>,

    #[serde(default)]
    pub disk_pools: Vec<DiskPool>,

    #[serde(default)]
    pub update: Update,
}

impl Manifest {
    pub fn find_job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Resolves the persistent disk settings of a job.
    ///
    /// A named `persistent_disk_pool` wins over a bare `persistent_disk`
    /// size. A job with neither gets an empty pool (size 0).
    pub fn disk_pool(&self, job_name: &str) -> Result<DiskPool, ManifestError> {
        let job = self
            .find_job(job_name)
            .ok_or_else(|| ManifestError::JobNotFound(job_name.to_string()))?;

        if let Some(pool_name) = job.persistent_disk_pool.as_deref().filter(|n| !n.is_empty()) {
            return self
                .disk_pools
                .iter()
                .find(|pool| pool.name == pool_name)
                .cloned()
                .ok_or_else(|| ManifestError::DiskPoolNotFound {
                    pool: pool_name.to_string(),
                    job: job_name.to_string(),
                });
        }

        if job.persistent_disk > 0 {
            return Ok(DiskPool {
                name: String::new(),
                disk_size: job.persistent_disk,
                cloud_properties: CloudProperties::new(),
            });
        }

        Ok(DiskPool::default())
    }
}

/// A job in the deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,

    #[serde(default)]
    pub instances: u32,

    #[serde(default)]
    pub templates: Vec<ReleaseJobRef>,

    #[serde(default)]
    pub networks: Vec<JobNetwork>,

    /// Persistent disk size in MB.
    #[serde(default)]
    pub persistent_disk: u64,

    #[serde(default)]
    pub persistent_disk_pool: Option<String>,

    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// A release job rendered onto a deployment job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseJobRef {
    pub name: String,
    pub release: String,
}

/// A network a job is placed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNetwork {
    pub name: String,

    #[serde(default)]
    pub static_ips: Vec<String>,
}

/// Named persistent disk specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskPool {
    pub name: String,

    /// Size in MB.
    pub disk_size: u64,

    #[serde(default)]
    pub cloud_properties: CloudProperties,
}

/// Update settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_watch_time: WatchTime,
}

/// Window, in milliseconds after a job start, in which it must report running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTime {
    pub start: u64,
    pub end: u64,
}

/// Registry the agent reads its settings from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// SSH access to the VM's network, used to tunnel the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Path to a private key file.
    #[serde(default)]
    pub private_key: String,
}

impl SshTunnelConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> Manifest {
        serde_json::from_value(json!({
            "name": "bosh",
            "jobs": [
                {"name": "director", "persistent_disk_pool": "fast"},
                {"name": "sized", "persistent_disk": 2048},
                {"name": "missing-pool", "persistent_disk_pool": "slow"},
                {"name": "diskless"}
            ],
            "disk_pools": [
                {"name": "fast", "disk_size": 1024, "cloud_properties": {"type": "ssd"}}
            ],
            "update": {"update_watch_time": {"start": 0, "end": 5000}}
        }))
        .unwrap()
    }

    #[test]
    fn test_disk_pool_by_name() {
        let pool = manifest().disk_pool("director").unwrap();
        assert_eq!(pool.name, "fast");
        assert_eq!(pool.disk_size, 1024);
        assert_eq!(pool.cloud_properties["type"], "ssd");
    }

    #[test]
    fn test_disk_pool_from_persistent_disk_size() {
        let pool = manifest().disk_pool("sized").unwrap();
        assert_eq!(pool.disk_size, 2048);
        assert!(pool.cloud_properties.is_empty());
    }

    #[test]
    fn test_disk_pool_empty_without_disk() {
        assert_eq!(manifest().disk_pool("diskless").unwrap(), DiskPool::default());
    }

    #[test]
    fn test_disk_pool_errors() {
        assert_eq!(
            manifest().disk_pool("nope").unwrap_err(),
            ManifestError::JobNotFound("nope".into())
        );
        assert_eq!(
            manifest().disk_pool("missing-pool").unwrap_err().to_string(),
            "Could not find persistent disk pool 'slow' for job 'missing-pool'"
        );
    }

    #[test]
    fn test_watch_time() {
        let update = manifest().update;
        assert_eq!(update.update_watch_time, WatchTime { start: 0, end: 5000 });
    }

    #[test]
    fn test_registry_and_tunnel_emptiness() {
        assert!(Registry::default().is_empty());
        assert!(SshTunnelConfig::default().is_empty());

        let registry = Registry {
            port: 6901,
            ..Default::default()
        };
        assert!(!registry.is_empty());

        let tunnel = SshTunnelConfig {
            host: "10.0.0.5".into(),
            ..Default::default()
        };
        assert!(!tunnel.is_empty());
    }
}
