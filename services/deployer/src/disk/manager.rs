use std::sync::Arc;

use anyhow::{Context, Result};
use dirboot_id::{DiskCid, VmCid};
use tracing::{debug, warn};

use super::{Disk, DiskRepo};
use crate::cloud::{skip_if_not_found, Cloud, CloudErrorType};
use crate::manifest::DiskPool;
use crate::stage::{step, Stage};

/// Creates, finds and deletes deployment disks, keeping the registry in
/// step with the cloud.
pub struct DiskManager {
    cloud: Arc<dyn Cloud>,
    repo: Arc<dyn DiskRepo>,
}

impl DiskManager {
    pub fn new(cloud: Arc<dyn Cloud>, repo: Arc<dyn DiskRepo>) -> Self {
        Self { cloud, repo }
    }

    fn handle(&self, record: super::DiskRecord) -> Disk {
        Disk::new(record, Arc::clone(&self.cloud), Arc::clone(&self.repo))
    }

    /// The current disk, if any. Returns zero or one disk.
    pub fn find_current(&self) -> Result<Vec<Disk>> {
        let record = self.repo.find_current().context("Reading disk record")?;
        Ok(record.into_iter().map(|r| self.handle(r)).collect())
    }

    /// Looks up a disk by its cloud ID.
    pub fn find_by_cid(&self, cid: &DiskCid) -> Result<Option<Disk>> {
        let record = self
            .repo
            .find(cid)
            .with_context(|| format!("Finding disk record for '{cid}'"))?;
        Ok(record.map(|r| self.handle(r)))
    }

    /// Handle for a disk the registry may not know about.
    pub fn disk_for_cid(&self, cid: &DiskCid) -> Result<Disk> {
        match self.find_by_cid(cid)? {
            Some(disk) => Ok(disk),
            None => {
                warn!(disk_cid = %cid, "Disk has no registry record");
                Ok(Disk::untracked(cid.clone(), Arc::clone(&self.cloud), Arc::clone(&self.repo)))
            }
        }
    }

    /// Creates a disk for the pool next to `vm_cid` and records it.
    ///
    /// The new disk is not made current. If the record cannot be saved the
    /// cloud disk is deleted again so it is not orphaned.
    pub async fn create(&self, disk_pool: &DiskPool, vm_cid: &VmCid) -> Result<Disk> {
        let cloud_properties = &disk_pool.cloud_properties;

        debug!(size = disk_pool.disk_size, vm_cid = %vm_cid, "Creating disk");
        let cid = self
            .cloud
            .create_disk(disk_pool.disk_size, cloud_properties, vm_cid)
            .await
            .with_context(|| {
                format!(
                    "Creating disk with size {}, cloudProperties {:?}, instanceID {}",
                    disk_pool.disk_size, cloud_properties, vm_cid
                )
            })?;

        let record = match self.repo.save(&cid, disk_pool.disk_size, cloud_properties) {
            Ok(record) => record,
            Err(save_err) => {
                if let Err(delete_err) = self.cloud.delete_disk(&cid).await {
                    warn!(
                        disk_cid = %cid,
                        error = %delete_err,
                        "Failed to delete disk after its record could not be saved"
                    );
                }
                return Err(save_err).context("Saving deployment disk record");
            }
        };

        Ok(self.handle(record))
    }

    /// Makes `disk` the current disk.
    pub fn set_current(&self, disk: &Disk) -> Result<()> {
        self.repo
            .update_current(disk.record().id)
            .with_context(|| format!("Marking disk '{}' as current", disk.cid()))
    }

    /// Every recorded disk except the current one, oldest first.
    pub fn find_unused(&self) -> Result<Vec<Disk>> {
        let records = self.repo.all().context("Getting all disk records")?;
        let current = self
            .repo
            .find_current()
            .context("Finding current disk record")?;

        Ok(records
            .into_iter()
            .filter(|r| current.as_ref().map_or(true, |c| c.id != r.id))
            .map(|r| self.handle(r))
            .collect())
    }

    /// Deletes every unused disk, one step per disk.
    ///
    /// Disks already gone from the cloud are skipped. Any other failure stops
    /// the sweep.
    pub async fn delete_unused(&self, stage: &dyn Stage) -> Result<()> {
        let disks = self.find_unused().context("Finding unused disks")?;

        for disk in &disks {
            let step_name = format!("Deleting unused disk '{}'", disk.cid());
            stage
                .perform_step(
                    &step_name,
                    step(async { skip_if_not_found(disk.delete().await, CloudErrorType::DiskNotFound) }),
                )
                .await?;
        }

        Ok(())
    }
}
