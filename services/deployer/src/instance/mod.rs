//! Instance lifecycle.
//!
//! An [`Instance`] is one slot `(job_name, id)` of a deployment job. It owns
//! the handle to its VM and drives it through agent readiness, disk and job
//! convergence, and shutdown. Each entry point checks the instance's
//! [`InstanceLifecycle`] before doing any work; a deleted instance refuses
//! every further operation.

pub mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cloud::{skip_if_not_found, CloudErrorType};
use crate::disk::Disk;
use crate::manifest::{Manifest, Registry, SshTunnelConfig, WatchTime};
use crate::sshtunnel::{self, SshTunnel, SshTunnelFactory};
use crate::stage::{step, Stage};
use crate::stemcell::StemcellApplySpec;
use crate::vm::Vm;

pub use state::{BlobRef, InstanceState, JobRef, NetworkRef, PackageRef, StateBuilder};

/// Where an instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLifecycle {
    /// Known by slot, agent not yet contacted.
    Unprovisioned,
    AwaitingAgent,
    ConvergingDisks,
    ConvergingJobs,
    Running,
    ShuttingDown,
    /// Terminal.
    Deleted,
}

impl InstanceLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::AwaitingAgent => "awaiting_agent",
            Self::ConvergingDisks => "converging_disks",
            Self::ConvergingJobs => "converging_jobs",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Deleted => "deleted",
        }
    }

    /// Returns true if an operation may move the instance from `self` to
    /// `next`. Failed operations leave the instance where the operation put
    /// it, so every non-terminal state may be re-entered.
    pub fn can_transition_to(&self, next: InstanceLifecycle) -> bool {
        use InstanceLifecycle::*;
        match self {
            Unprovisioned => matches!(next, AwaitingAgent | ShuttingDown),
            AwaitingAgent => matches!(
                next,
                AwaitingAgent | ConvergingDisks | ConvergingJobs | ShuttingDown
            ),
            ConvergingDisks => matches!(next, ConvergingDisks | ConvergingJobs | ShuttingDown),
            ConvergingJobs => matches!(next, ConvergingJobs | Running | ShuttingDown),
            Running => matches!(
                next,
                AwaitingAgent | ConvergingDisks | ConvergingJobs | ShuttingDown
            ),
            ShuttingDown => matches!(next, ShuttingDown | Deleted),
            Deleted => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for InstanceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance '{instance}' cannot go from {from} to {to}")]
    InvalidTransition {
        instance: String,
        from: InstanceLifecycle,
        to: InstanceLifecycle,
    },
}

/// Timing for instance operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSettings {
    pub agent_wait_timeout: Duration,
    pub agent_poll_delay: Duration,
    /// Spacing between job-state polls. Must be at least one millisecond.
    pub jobs_poll_interval: Duration,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            agent_wait_timeout: Duration::from_secs(10 * 60),
            agent_poll_delay: Duration::from_millis(500),
            jobs_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Number of job-state polls that fit in the watch window.
fn watch_attempts(watch: WatchTime, interval: Duration) -> Result<u32> {
    let window = u128::from(watch.end.saturating_sub(watch.start));
    let attempts = window
        .checked_div(interval.as_millis())
        .ok_or_else(|| anyhow!("Job poll interval must be at least 1ms, got {interval:?}"))?;
    Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
}

/// Stops the tunnel when dropped.
struct TunnelGuard {
    tunnel: Arc<dyn SshTunnel>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tunnel.stop() {
            warn!(error = %e, "Failed to stop SSH tunnel");
        }
    }
}

/// One slot of a deployment job and the VM that runs it.
pub struct Instance {
    job_name: String,
    id: u32,
    vm: Box<dyn Vm>,
    ssh_tunnel_factory: Arc<dyn SshTunnelFactory>,
    state_builder: Arc<dyn StateBuilder>,
    settings: InstanceSettings,
    lifecycle: InstanceLifecycle,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("job_name", &self.job_name)
            .field("id", &self.id)
            .field("vm_cid", self.vm.cid())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(
        job_name: impl Into<String>,
        id: u32,
        vm: Box<dyn Vm>,
        ssh_tunnel_factory: Arc<dyn SshTunnelFactory>,
        state_builder: Arc<dyn StateBuilder>,
        settings: InstanceSettings,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            id,
            vm,
            ssh_tunnel_factory,
            state_builder,
            settings,
            lifecycle: InstanceLifecycle::Unprovisioned,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vm(&self) -> &dyn Vm {
        self.vm.as_ref()
    }

    pub fn lifecycle(&self) -> InstanceLifecycle {
        self.lifecycle
    }

    /// `<job>/<id>`, as used in step names.
    fn slot(&self) -> String {
        format!("{}/{}", self.job_name, self.id)
    }

    fn transition(&mut self, next: InstanceLifecycle) -> Result<(), LifecycleError> {
        if !self.lifecycle.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                instance: self.slot(),
                from: self.lifecycle,
                to: next,
            });
        }

        debug!(instance = %self.slot(), from = %self.lifecycle, to = %next, "Instance transition");
        self.lifecycle = next;
        Ok(())
    }

    /// Disks the agent reports as attached.
    pub async fn disks(&self) -> Result<Vec<Disk>> {
        self.vm.disks().await.context("Listing instance disks")
    }

    /// Waits until the VM's agent answers pings.
    ///
    /// When both the registry and the tunnel are configured, a reverse SSH
    /// tunnel forwards the registry port into the VM for the duration of
    /// the wait.
    pub async fn wait_until_ready(
        &mut self,
        registry: &Registry,
        ssh_tunnel_config: &SshTunnelConfig,
        stage: &dyn Stage,
    ) -> Result<()> {
        self.transition(InstanceLifecycle::AwaitingAgent)?;

        let step_name = format!("Waiting for the agent on VM '{}' to be ready", self.vm.cid());
        let vm = self.vm.as_ref();
        let settings = self.settings;
        let factory = Arc::clone(&self.ssh_tunnel_factory);

        stage
            .perform_step(
                &step_name,
                step(async move {
                    let _tunnel = if !registry.is_empty() && !ssh_tunnel_config.is_empty() {
                        let options = sshtunnel::Options {
                            host: ssh_tunnel_config.host.clone(),
                            port: ssh_tunnel_config.port,
                            user: ssh_tunnel_config.user.clone(),
                            password: ssh_tunnel_config.password.clone(),
                            private_key: ssh_tunnel_config.private_key.clone(),
                            local_forward_port: registry.port,
                            remote_forward_port: registry.port,
                        };
                        Some(start_tunnel(factory.as_ref(), options).await?)
                    } else {
                        None
                    };

                    vm.wait_until_ready(settings.agent_wait_timeout, settings.agent_poll_delay)
                        .await?;
                    Ok(())
                }),
            )
            .await
    }

    /// Converges the VM's persistent disk to the job's disk pool.
    pub async fn update_disks(&mut self, manifest: &Manifest, stage: &dyn Stage) -> Result<Vec<Disk>> {
        self.transition(InstanceLifecycle::ConvergingDisks)?;

        let disk_pool = manifest
            .disk_pool(&self.job_name)
            .context("Getting disk pool")?;

        self.vm
            .update_disks(&disk_pool, stage)
            .await
            .context("Updating disks")
    }

    /// Pushes the instance's desired state to the agent and waits for its
    /// jobs to run.
    pub async fn update_jobs(
        &mut self,
        manifest: &Manifest,
        stemcell_apply_spec: &StemcellApplySpec,
        stage: &dyn Stage,
    ) -> Result<()> {
        self.transition(InstanceLifecycle::ConvergingJobs)?;

        let state = self
            .state_builder
            .build(&self.job_name, self.id, manifest, stemcell_apply_spec)
            .await
            .with_context(|| format!("Building state for instance '{}'", self.slot()))?;
        let apply_spec = state.to_apply_spec();

        let step_name = format!("Updating instance '{}'", self.slot());
        let vm = self.vm.as_ref();
        stage
            .perform_step(
                &step_name,
                step(async move {
                    vm.stop().await.context("Stopping the agent")?;
                    vm.apply(&apply_spec).await.context("Applying the agent state")?;
                    vm.start().await.context("Starting the agent")?;
                    Ok(())
                }),
            )
            .await?;

        self.wait_until_jobs_are_running(manifest.update.update_watch_time, stage)
            .await?;

        self.transition(InstanceLifecycle::Running)?;
        info!(instance = %self.slot(), "Instance is running");
        Ok(())
    }

    async fn wait_until_jobs_are_running(&self, watch: WatchTime, stage: &dyn Stage) -> Result<()> {
        let interval = self.settings.jobs_poll_interval;
        let max_attempts = watch_attempts(watch, interval)
            .with_context(|| format!("Waiting for instance '{}' to be running", self.slot()))?;
        let initial_wait = Duration::from_millis(watch.start);

        let step_name = format!("Waiting for instance '{}' to be running", self.slot());
        let vm = self.vm.as_ref();
        stage
            .perform_step(
                &step_name,
                step(async move {
                    tokio::time::sleep(initial_wait).await;
                    vm.wait_to_be_running(max_attempts, interval).await?;
                    Ok(())
                }),
            )
            .await
    }

    /// Shuts the instance down and deletes its VM.
    ///
    /// A VM that no longer exists is still deleted through the cloud so the
    /// provider can clean up what it owns; the step is reported as skipped
    /// if the cloud says the VM is gone. An agent that does not answer only
    /// skips the shutdown; the VM delete is issued either way.
    pub async fn delete(&mut self, ping_timeout: Duration, ping_delay: Duration, stage: &dyn Stage) -> Result<()> {
        self.transition(InstanceLifecycle::ShuttingDown)?;

        let exists = self
            .vm
            .exists()
            .await
            .with_context(|| format!("Checking existence of VM for instance '{}'", self.slot()))?;

        if exists {
            self.shutdown(ping_timeout, ping_delay, stage).await?;
        }

        let step_name = format!("Deleting VM '{}'", self.vm.cid());
        let vm = self.vm.as_ref();
        stage
            .perform_step(
                &step_name,
                step(async move { skip_if_not_found(vm.delete().await, CloudErrorType::VmNotFound) }),
            )
            .await?;

        self.transition(InstanceLifecycle::Deleted)?;
        Ok(())
    }

    async fn shutdown(&self, ping_timeout: Duration, ping_delay: Duration, stage: &dyn Stage) -> Result<()> {
        let step_name = format!("Waiting for the agent on VM '{}'", self.vm.cid());
        let vm = self.vm.as_ref();
        let waited = stage
            .perform_step(
                &step_name,
                step(async move {
                    vm.wait_until_ready(ping_timeout, ping_delay)
                        .await
                        .context("Agent unreachable")?;
                    Ok(())
                }),
            )
            .await;

        if let Err(e) = waited {
            warn!(instance = %self.slot(), error = %format!("{e:#}"), "Gave up waiting for agent, skipping shutdown");
            return Ok(());
        }

        self.stop_jobs(stage).await?;
        self.unmount_disks(stage).await
    }

    async fn stop_jobs(&self, stage: &dyn Stage) -> Result<()> {
        let step_name = format!("Stopping jobs on instance '{}'", self.slot());
        let vm = self.vm.as_ref();
        stage
            .perform_step(&step_name, step(async move { Ok(vm.stop().await?) }))
            .await
    }

    async fn unmount_disks(&self, stage: &dyn Stage) -> Result<()> {
        let vm = self.vm.as_ref();
        let disks = vm
            .disks()
            .await
            .with_context(|| format!("Getting VM '{}' disks", vm.cid()))?;

        for disk in &disks {
            let step_name = format!("Unmounting disk '{}'", disk.cid());
            stage
                .perform_step(
                    &step_name,
                    step(async move {
                        vm.unmount_disk(disk).await.with_context(|| {
                            format!("Unmounting disk '{}' from VM '{}'", disk.cid(), vm.cid())
                        })?;
                        Ok(())
                    }),
                )
                .await?;
        }

        Ok(())
    }
}

/// Starts a tunnel on a blocking thread and waits until it is ready.
///
/// The returned guard stops the tunnel when dropped. Errors raised by the
/// tunnel after it is ready are logged.
async fn start_tunnel(factory: &dyn SshTunnelFactory, options: sshtunnel::Options) -> Result<TunnelGuard> {
    info!(host = %options.host, port = options.port, forward_port = options.remote_forward_port, "Starting SSH tunnel");

    let tunnel = factory.new_ssh_tunnel(options);
    let guard = TunnelGuard {
        tunnel: Arc::clone(&tunnel),
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();

    tokio::task::spawn_blocking(move || tunnel.start(ready_tx, errors_tx));
    tokio::spawn(async move {
        while let Some(e) = errors_rx.recv().await {
            warn!(error = %e, "SSH tunnel error");
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(guard),
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("Starting SSH tunnel")),
        Err(_) => Err(anyhow!("SSH tunnel exited before reporting readiness")).context("Starting SSH tunnel"),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 5000, 1000, 5)]
    #[case(1000, 5000, 1000, 4)]
    #[case(0, 4500, 1000, 4)]
    #[case(5000, 1000, 1000, 0)]
    fn test_watch_attempts(#[case] start: u64, #[case] end: u64, #[case] interval_ms: u64, #[case] expected: u32) {
        let watch = WatchTime { start, end };
        assert_eq!(watch_attempts(watch, Duration::from_millis(interval_ms)).unwrap(), expected);
    }

    #[rstest]
    #[case(Duration::ZERO)]
    #[case(Duration::from_micros(999))]
    fn test_watch_attempts_rejects_sub_millisecond_interval(#[case] interval: Duration) {
        let watch = WatchTime { start: 0, end: 5000 };
        let err = watch_attempts(watch, interval).unwrap_err();
        assert!(err.to_string().contains("at least 1ms"), "{err}");
    }

    #[test]
    fn test_lifecycle_forward_path() {
        use InstanceLifecycle::*;
        let path = [
            Unprovisioned,
            AwaitingAgent,
            ConvergingDisks,
            ConvergingJobs,
            Running,
            ShuttingDown,
            Deleted,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_lifecycle_rejections() {
        use InstanceLifecycle::*;
        assert!(!Unprovisioned.can_transition_to(ConvergingJobs));
        assert!(!ShuttingDown.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(ShuttingDown));
        assert!(Deleted.is_terminal());
    }

    #[test]
    fn test_default_settings() {
        let settings = InstanceSettings::default();
        assert_eq!(settings.agent_wait_timeout, Duration::from_secs(600));
        assert_eq!(settings.agent_poll_delay, Duration::from_millis(500));
        assert_eq!(settings.jobs_poll_interval, Duration::from_secs(1));
    }
}
