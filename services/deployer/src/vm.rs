//! Operations on one deployed VM.
//!
//! [`AgentVm`] combines the cloud (for the VM and its disks) with the agent
//! running inside the VM (for jobs and mounts).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dirboot_id::VmCid;
use dirboot_reconcile::{AttemptRetryStrategy, Retryable, TimeoutRetryStrategy};
use tracing::{debug, info};

use crate::agentclient::{AgentClient, PingRetryable};
use crate::applyspec::ApplySpec;
use crate::cloud::Cloud;
use crate::disk::{Disk, DiskManager};
use crate::manifest::DiskPool;
use crate::stage::{step, Stage};

/// A deployed VM.
#[async_trait]
pub trait Vm: Send + Sync {
    fn cid(&self) -> &VmCid;

    async fn exists(&self) -> Result<bool>;

    /// Waits until the agent answers, polling every `delay` for up to `timeout`.
    async fn wait_until_ready(&self, timeout: Duration, delay: Duration) -> Result<()>;

    /// Makes the VM's persistent disk match `disk_pool`. Returns the disks
    /// attached afterwards.
    async fn update_disks(&self, disk_pool: &DiskPool, stage: &dyn Stage) -> Result<Vec<Disk>>;

    async fn stop(&self) -> Result<()>;

    async fn apply(&self, spec: &ApplySpec) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Polls the agent until its jobs report running.
    async fn wait_to_be_running(&self, max_attempts: u32, delay: Duration) -> Result<()>;

    async fn attach_disk(&self, disk: &Disk) -> Result<()>;

    async fn detach_disk(&self, disk: &Disk) -> Result<()>;

    /// Disks the agent reports as mounted.
    async fn disks(&self) -> Result<Vec<Disk>>;

    async fn unmount_disk(&self, disk: &Disk) -> Result<()>;

    /// Deletes the VM. Cloud errors come back unwrapped so callers can
    /// classify them.
    async fn delete(&self) -> Result<()>;
}

/// [`Vm`] driven through the cloud and the VM's agent.
pub struct AgentVm {
    cid: VmCid,
    cloud: Arc<dyn Cloud>,
    agent_client: Arc<dyn AgentClient>,
    disk_manager: Arc<DiskManager>,
}

impl AgentVm {
    pub fn new(
        cid: VmCid,
        cloud: Arc<dyn Cloud>,
        agent_client: Arc<dyn AgentClient>,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        Self {
            cid,
            cloud,
            agent_client,
            disk_manager,
        }
    }

    async fn create_disk_step(&self, disk_pool: &DiskPool, stage: &dyn Stage) -> Result<Disk> {
        let mut created = None;
        stage
            .perform_step(
                "Creating disk",
                step(async {
                    created = Some(self.disk_manager.create(disk_pool, &self.cid).await?);
                    Ok(())
                }),
            )
            .await?;

        created.ok_or_else(|| anyhow!("Creating disk produced no disk"))
    }

    async fn attach_disk_step(&self, disk: &Disk, stage: &dyn Stage) -> Result<()> {
        let step_name = format!("Attaching disk '{}' to VM '{}'", disk.cid(), self.cid);
        stage
            .perform_step(&step_name, step(async { Ok(self.attach_disk(disk).await?) }))
            .await
    }

    async fn migrate_disk_step(&self, old: &Disk, new: &Disk, stage: &dyn Stage) -> Result<()> {
        let step_name = format!("Migrating disk content from '{}' to '{}'", old.cid(), new.cid());
        stage
            .perform_step(
                &step_name,
                step(async {
                    self.agent_client
                        .migrate_disk()
                        .await
                        .context("Migrating disk content")?;
                    Ok(())
                }),
            )
            .await
    }

    async fn detach_disk_step(&self, disk: &Disk, stage: &dyn Stage) -> Result<()> {
        let step_name = format!("Detaching disk '{}'", disk.cid());
        stage
            .perform_step(
                &step_name,
                step(async {
                    self.agent_client
                        .unmount_disk(disk.cid())
                        .await
                        .with_context(|| format!("Unmounting disk '{}'", disk.cid()))?;
                    Ok(self.detach_disk(disk).await?)
                }),
            )
            .await
    }
}

#[async_trait]
impl Vm for AgentVm {
    fn cid(&self) -> &VmCid {
        &self.cid
    }

    async fn exists(&self) -> Result<bool> {
        self.cloud
            .has_vm(&self.cid)
            .await
            .with_context(|| format!("Checking existence of VM '{}'", self.cid))
    }

    async fn wait_until_ready(&self, timeout: Duration, delay: Duration) -> Result<()> {
        debug!(vm_cid = %self.cid, ?timeout, ?delay, "Waiting for agent");
        let ping = PingRetryable::new(self.agent_client.as_ref());
        TimeoutRetryStrategy::new(timeout, delay)
            .try_run(&ping)
            .await
            .with_context(|| format!("Waiting for the agent on VM '{}'", self.cid))
    }

    async fn update_disks(&self, disk_pool: &DiskPool, stage: &dyn Stage) -> Result<Vec<Disk>> {
        if disk_pool.disk_size == 0 {
            return Ok(Vec::new());
        }

        let current = self.disk_manager.find_current()?.into_iter().next();

        let disk = match current {
            None => {
                let disk = self.create_disk_step(disk_pool, stage).await?;
                self.attach_disk_step(&disk, stage).await?;
                disk
            }
            Some(old) if old.needs_migration(disk_pool.disk_size, &disk_pool.cloud_properties) => {
                info!(vm_cid = %self.cid, disk_cid = %old.cid(), "Persistent disk needs migration");
                let new = self.create_disk_step(disk_pool, stage).await?;
                self.attach_disk_step(&new, stage).await?;
                self.migrate_disk_step(&old, &new, stage).await?;
                self.detach_disk_step(&old, stage).await?;
                new
            }
            Some(current) => {
                self.attach_disk_step(&current, stage).await?;
                current
            }
        };

        self.disk_manager.set_current(&disk)?;
        Ok(vec![disk])
    }

    async fn stop(&self) -> Result<()> {
        Ok(self.agent_client.stop().await?)
    }

    async fn apply(&self, spec: &ApplySpec) -> Result<()> {
        Ok(self.agent_client.apply(spec).await?)
    }

    async fn start(&self) -> Result<()> {
        Ok(self.agent_client.start().await?)
    }

    async fn wait_to_be_running(&self, max_attempts: u32, delay: Duration) -> Result<()> {
        let poll = JobsRunning {
            agent_client: self.agent_client.as_ref(),
        };
        AttemptRetryStrategy::new(max_attempts, delay)
            .try_run(&poll)
            .await
            .context("Waiting for jobs to be running")
    }

    async fn attach_disk(&self, disk: &Disk) -> Result<()> {
        self.cloud
            .attach_disk(&self.cid, disk.cid())
            .await
            .with_context(|| format!("Attaching disk '{}' in the cloud", disk.cid()))?;
        self.agent_client
            .mount_disk(disk.cid())
            .await
            .with_context(|| format!("Mounting disk '{}'", disk.cid()))
    }

    async fn detach_disk(&self, disk: &Disk) -> Result<()> {
        self.cloud
            .detach_disk(&self.cid, disk.cid())
            .await
            .with_context(|| format!("Detaching disk '{}' in the cloud", disk.cid()))
    }

    async fn disks(&self) -> Result<Vec<Disk>> {
        let cids = self
            .agent_client
            .list_disk()
            .await
            .context("Listing disks mounted by the agent")?;

        cids.iter()
            .map(|cid| self.disk_manager.disk_for_cid(cid))
            .collect()
    }

    async fn unmount_disk(&self, disk: &Disk) -> Result<()> {
        Ok(self.agent_client.unmount_disk(disk.cid()).await?)
    }

    async fn delete(&self) -> Result<()> {
        Ok(self.cloud.delete_vm(&self.cid).await?)
    }
}

/// One `get_state` poll; retryable until jobs are running.
struct JobsRunning<'a> {
    agent_client: &'a dyn AgentClient,
}

#[async_trait]
impl Retryable for JobsRunning<'_> {
    async fn attempt(&self) -> (bool, Result<()>) {
        match self.agent_client.get_state().await {
            Ok(state) if state.is_running() => (true, Ok(())),
            Ok(state) => (true, Err(anyhow!("Job state is '{}'", state.job_state))),
            Err(e) => (true, Err(anyhow::Error::from(e).context("Getting agent state"))),
        }
    }
}
