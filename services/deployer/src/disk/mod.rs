//! Persistent disks.
//!
//! A [`Disk`] pairs a registry record with the cloud that owns the disk. It
//! is a short-lived handle; the registry stays the source of truth.

mod manager;
mod repo;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dirboot_id::{DiskCid, DiskRecordId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cloud::{Cloud, CloudErrorType, CloudProperties};

pub use manager::DiskManager;
pub use repo::{DiskRepo, DiskRepoError, SqliteDiskRepo};

/// Registry entry for a cloud disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: DiskRecordId,
    pub cid: DiskCid,
    /// Size in MB.
    pub size: u64,
    pub cloud_properties: CloudProperties,
    pub created_at: DateTime<Utc>,
}

/// Handle to a cloud disk.
#[derive(Clone)]
pub struct Disk {
    record: DiskRecord,
    tracked: bool,
    cloud: Arc<dyn Cloud>,
    repo: Arc<dyn DiskRepo>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("record", &self.record)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

impl Disk {
    pub fn new(record: DiskRecord, cloud: Arc<dyn Cloud>, repo: Arc<dyn DiskRepo>) -> Self {
        Self {
            record,
            tracked: true,
            cloud,
            repo,
        }
    }

    /// A disk the cloud reports but the registry has no record of.
    pub fn untracked(cid: DiskCid, cloud: Arc<dyn Cloud>, repo: Arc<dyn DiskRepo>) -> Self {
        Self {
            record: DiskRecord {
                id: DiskRecordId::new(),
                cid,
                size: 0,
                cloud_properties: CloudProperties::new(),
                created_at: Utc::now(),
            },
            tracked: false,
            cloud,
            repo,
        }
    }

    pub fn cid(&self) -> &DiskCid {
        &self.record.cid
    }

    pub fn record(&self) -> &DiskRecord {
        &self.record
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Returns true if the disk no longer matches the requested settings.
    pub fn needs_migration(&self, size: u64, cloud_properties: &CloudProperties) -> bool {
        self.record.size != size || self.record.cloud_properties != *cloud_properties
    }

    /// Deletes the disk from the cloud and drops its record.
    ///
    /// A disk the cloud no longer knows is forgotten as well, but the
    /// not-found error is still returned for the caller to classify.
    pub async fn delete(&self) -> anyhow::Result<()> {
        match self.cloud.delete_disk(&self.record.cid).await {
            Ok(()) => {
                info!(disk_cid = %self.record.cid, "Deleted disk");
                self.forget()
            }
            Err(e) if e.is(&CloudErrorType::DiskNotFound) => {
                warn!(disk_cid = %self.record.cid, "Disk already gone from the cloud");
                self.forget()?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn forget(&self) -> anyhow::Result<()> {
        if self.tracked {
            self.repo.delete(self.record.id)?;
        }
        Ok(())
    }
}
