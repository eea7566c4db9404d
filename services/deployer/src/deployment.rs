//! A deployed environment and its teardown.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::cloud::{skip_if_not_found, CloudErrorType};
use crate::disk::Disk;
use crate::instance::Instance;
use crate::stage::{step, Stage};
use crate::stemcell::CloudStemcell;

/// Instances, disks and stemcells of one deployment.
#[derive(Debug)]
pub struct Deployment {
    instances: Vec<Instance>,
    disks: Vec<Disk>,
    stemcells: Vec<CloudStemcell>,
    ping_timeout: Duration,
    ping_delay: Duration,
}

impl Deployment {
    pub fn new(
        instances: Vec<Instance>,
        disks: Vec<Disk>,
        stemcells: Vec<CloudStemcell>,
        ping_timeout: Duration,
        ping_delay: Duration,
    ) -> Self {
        Self {
            instances,
            disks,
            stemcells,
            ping_timeout,
            ping_delay,
        }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    pub fn stemcells(&self) -> &[CloudStemcell] {
        &self.stemcells
    }

    /// Deletes instances, then disks, then stemcells.
    ///
    /// Each collection is drained from the back. An element is dropped only
    /// once its deletion succeeded, so after an error the deployment holds
    /// exactly what is left to delete and `delete` can be called again.
    pub async fn delete(&mut self, stage: &dyn Stage) -> Result<()> {
        info!(
            instances = self.instances.len(),
            disks = self.disks.len(),
            stemcells = self.stemcells.len(),
            "Deleting deployment"
        );

        while let Some(instance) = self.instances.last_mut() {
            instance.delete(self.ping_timeout, self.ping_delay, stage).await?;
            self.instances.pop();
        }

        while let Some(disk) = self.disks.last() {
            let step_name = format!("Deleting disk '{}'", disk.cid());
            stage
                .perform_step(
                    &step_name,
                    step(async { skip_if_not_found(disk.delete().await, CloudErrorType::DiskNotFound) }),
                )
                .await?;
            self.disks.pop();
        }

        while let Some(stemcell) = self.stemcells.last() {
            let step_name = format!("Deleting stemcell '{}'", stemcell.cid());
            stage
                .perform_step(
                    &step_name,
                    step(async {
                        skip_if_not_found(stemcell.delete().await, CloudErrorType::StemcellNotFound)
                    }),
                )
                .await?;
            self.stemcells.pop();
        }

        Ok(())
    }
}
