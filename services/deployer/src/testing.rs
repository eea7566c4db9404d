//! Fakes for the deployer's collaborators.
//!
//! Every fake records what was asked of it and can be told to fail. They
//! keep their state behind a mutex so tests can hold one handle while the
//! code under test holds another.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dirboot_id::{DiskCid, StemcellCid, VmCid};
use tracing::info;

use crate::agentclient::{AgentClient, AgentClientError, AgentState};
use crate::applyspec::ApplySpec;
use crate::cloud::{Cloud, CloudError, CloudErrorType, CloudProperties};
use crate::disk::Disk;
use crate::instance::{BlobRef, InstanceState, JobRef, NetworkRef, StateBuilder};
use crate::manifest::{DiskPool, Manifest};
use crate::sshtunnel::{self, ErrorSender, ReadySender, SshTunnel, SshTunnelError, SshTunnelFactory, TunnelState};
use crate::stage::Stage;
use crate::stemcell::StemcellApplySpec;
use crate::vm::Vm;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cpi_error(method: &str, error_type: CloudErrorType) -> CloudError {
    CloudError::Cpi {
        method: method.to_string(),
        message: format!("fake-{method}-error"),
        error_type,
        ok_to_retry: false,
    }
}

// =============================================================================
// Cloud
// =============================================================================

/// A call received by [`FakeCloud`].
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    HasVm(VmCid),
    DeleteVm(VmCid),
    CreateDisk {
        size: u64,
        cloud_properties: CloudProperties,
        vm_cid: VmCid,
    },
    AttachDisk {
        vm_cid: VmCid,
        disk_cid: DiskCid,
    },
    DetachDisk {
        vm_cid: VmCid,
        disk_cid: DiskCid,
    },
    DeleteDisk(DiskCid),
    DeleteStemcell(StemcellCid),
}

#[derive(Default)]
struct FakeCloudState {
    calls: Vec<CloudCall>,
    method_failures: HashMap<String, CloudErrorType>,
    disk_failures: HashMap<DiskCid, CloudErrorType>,
    vm_missing: bool,
    disks_created: u32,
    created: Vec<DiskCid>,
}

/// In-memory [`Cloud`]. Disks are named `fake-disk-cid-<n>`.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeCloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.state).calls.clone()
    }

    /// Makes every call to `method` fail with `error_type`.
    pub fn fail_with(&self, method: &str, error_type: CloudErrorType) {
        lock(&self.state)
            .method_failures
            .insert(method.to_string(), error_type);
    }

    /// Makes disk operations on `cid` fail with `error_type`.
    pub fn fail_for_disk(&self, cid: &DiskCid, error_type: CloudErrorType) {
        lock(&self.state).disk_failures.insert(cid.clone(), error_type);
    }

    /// Makes `has_vm` report that no VM exists.
    pub fn set_vm_missing(&self, missing: bool) {
        lock(&self.state).vm_missing = missing;
    }

    /// The CID the next `create_disk` call will return.
    pub fn peek_next_disk_cid(&self) -> DiskCid {
        let next = lock(&self.state).disks_created + 1;
        fake_disk_cid(next)
    }

    /// Every disk created so far, deleted or not.
    pub fn created_disks(&self) -> Vec<DiskCid> {
        lock(&self.state).created.clone()
    }

    fn record(&self, method: &str, call: CloudCall) -> Result<(), CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        match state.method_failures.get(method) {
            Some(error_type) => Err(cpi_error(method, error_type.clone())),
            None => Ok(()),
        }
    }

    fn check_disk(&self, method: &str, cid: &DiskCid) -> Result<(), CloudError> {
        match lock(&self.state).disk_failures.get(cid) {
            Some(error_type) => Err(cpi_error(method, error_type.clone())),
            None => Ok(()),
        }
    }
}

fn fake_disk_cid(n: u32) -> DiskCid {
    DiskCid::parse(format!("fake-disk-cid-{n}")).expect("fake disk CIDs are non-empty")
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn has_vm(&self, vm_cid: &VmCid) -> Result<bool, CloudError> {
        self.record("has_vm", CloudCall::HasVm(vm_cid.clone()))?;
        Ok(!lock(&self.state).vm_missing)
    }

    async fn delete_vm(&self, vm_cid: &VmCid) -> Result<(), CloudError> {
        self.record("delete_vm", CloudCall::DeleteVm(vm_cid.clone()))
    }

    async fn create_disk(
        &self,
        size: u64,
        cloud_properties: &CloudProperties,
        vm_cid: &VmCid,
    ) -> Result<DiskCid, CloudError> {
        self.record(
            "create_disk",
            CloudCall::CreateDisk {
                size,
                cloud_properties: cloud_properties.clone(),
                vm_cid: vm_cid.clone(),
            },
        )?;

        let mut state = lock(&self.state);
        state.disks_created += 1;
        let cid = fake_disk_cid(state.disks_created);
        state.created.push(cid.clone());
        Ok(cid)
    }

    async fn attach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<(), CloudError> {
        self.record(
            "attach_disk",
            CloudCall::AttachDisk {
                vm_cid: vm_cid.clone(),
                disk_cid: disk_cid.clone(),
            },
        )?;
        self.check_disk("attach_disk", disk_cid)
    }

    async fn detach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<(), CloudError> {
        self.record(
            "detach_disk",
            CloudCall::DetachDisk {
                vm_cid: vm_cid.clone(),
                disk_cid: disk_cid.clone(),
            },
        )?;
        self.check_disk("detach_disk", disk_cid)
    }

    async fn delete_disk(&self, disk_cid: &DiskCid) -> Result<(), CloudError> {
        self.record("delete_disk", CloudCall::DeleteDisk(disk_cid.clone()))?;
        self.check_disk("delete_disk", disk_cid)
    }

    async fn delete_stemcell(&self, stemcell_cid: &StemcellCid) -> Result<(), CloudError> {
        self.record("delete_stemcell", CloudCall::DeleteStemcell(stemcell_cid.clone()))
    }
}

// =============================================================================
// Agent
// =============================================================================

#[derive(Default)]
struct FakeAgentState {
    calls: Vec<String>,
    ping_failures: u32,
    failures: HashMap<String, String>,
    job_states: VecDeque<String>,
    disks: Vec<DiskCid>,
    applied: Vec<ApplySpec>,
}

/// In-memory [`AgentClient`]. Jobs report `running` unless told otherwise.
#[derive(Default)]
pub struct FakeAgentClient {
    state: Mutex<FakeAgentState>,
}

impl FakeAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Method names in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Fails the next `count` pings with `fake-ping-error`.
    pub fn fail_pings(&self, count: u32) {
        lock(&self.state).ping_failures = count;
    }

    /// Makes every call to `method` fail with an agent exception.
    pub fn fail(&self, method: &str, message: &str) {
        lock(&self.state)
            .failures
            .insert(method.to_string(), message.to_string());
    }

    /// Queues a job state for `get_state` to return before `running`.
    pub fn push_job_state(&self, job_state: &str) {
        lock(&self.state).job_states.push_back(job_state.to_string());
    }

    pub fn set_disks(&self, cids: &[&str]) {
        lock(&self.state).disks = cids
            .iter()
            .filter_map(|cid| DiskCid::parse(*cid).ok())
            .collect();
    }

    pub fn applied_specs(&self) -> Vec<ApplySpec> {
        lock(&self.state).applied.clone()
    }

    fn record(&self, method: &str) -> Result<(), AgentClientError> {
        let mut state = lock(&self.state);
        state.calls.push(method.to_string());
        match state.failures.get(method) {
            Some(message) => Err(AgentClientError::Exception(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn ping(&self) -> Result<String, AgentClientError> {
        self.record("ping")?;
        let mut state = lock(&self.state);
        if state.ping_failures > 0 {
            state.ping_failures -= 1;
            return Err(AgentClientError::Exception("fake-ping-error".to_string()));
        }
        Ok("pong".to_string())
    }

    async fn stop(&self) -> Result<(), AgentClientError> {
        self.record("stop")
    }

    async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentClientError> {
        self.record("apply")?;
        lock(&self.state).applied.push(spec.clone());
        Ok(())
    }

    async fn start(&self) -> Result<(), AgentClientError> {
        self.record("start")
    }

    async fn get_state(&self) -> Result<AgentState, AgentClientError> {
        self.record("get_state")?;
        let job_state = lock(&self.state)
            .job_states
            .pop_front()
            .unwrap_or_else(|| "running".to_string());
        Ok(AgentState { job_state })
    }

    async fn mount_disk(&self, _disk_cid: &DiskCid) -> Result<(), AgentClientError> {
        self.record("mount_disk")
    }

    async fn unmount_disk(&self, _disk_cid: &DiskCid) -> Result<(), AgentClientError> {
        self.record("unmount_disk")
    }

    async fn list_disk(&self) -> Result<Vec<DiskCid>, AgentClientError> {
        self.record("list_disk")?;
        Ok(lock(&self.state).disks.clone())
    }

    async fn migrate_disk(&self) -> Result<(), AgentClientError> {
        self.record("migrate_disk")
    }
}

// =============================================================================
// VM
// =============================================================================

#[derive(Default)]
struct FakeVmState {
    calls: Vec<String>,
    missing: bool,
    failures: HashMap<String, String>,
    delete_error: Option<CloudErrorType>,
    disks: Vec<Disk>,
    ready_waits: Vec<(Duration, Duration)>,
    running_waits: Vec<(u32, Duration)>,
    applied: Vec<ApplySpec>,
}

/// In-memory [`Vm`]. Clones share state.
#[derive(Clone)]
pub struct FakeVm {
    cid: VmCid,
    state: Arc<Mutex<FakeVmState>>,
}

impl FakeVm {
    pub fn new(cid: VmCid) -> Self {
        Self {
            cid,
            state: Arc::default(),
        }
    }

    /// Method names in call order. Disk operations append the disk CID,
    /// e.g. `unmount_disk:vol-1`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn set_missing(&self, missing: bool) {
        lock(&self.state).missing = missing;
    }

    /// Makes every call to `method` fail with `message`.
    pub fn fail(&self, method: &str, message: &str) {
        lock(&self.state)
            .failures
            .insert(method.to_string(), message.to_string());
    }

    /// Makes `delete` fail with a CPI error of `error_type`.
    pub fn fail_delete_with(&self, error_type: CloudErrorType) {
        lock(&self.state).delete_error = Some(error_type);
    }

    /// Disks returned by `disks` and `update_disks`.
    pub fn set_disks(&self, disks: Vec<Disk>) {
        lock(&self.state).disks = disks;
    }

    /// `(timeout, delay)` of every `wait_until_ready` call.
    pub fn ready_waits(&self) -> Vec<(Duration, Duration)> {
        lock(&self.state).ready_waits.clone()
    }

    /// `(max_attempts, delay)` of every `wait_to_be_running` call.
    pub fn running_waits(&self) -> Vec<(u32, Duration)> {
        lock(&self.state).running_waits.clone()
    }

    pub fn applied_specs(&self) -> Vec<ApplySpec> {
        lock(&self.state).applied.clone()
    }

    fn record(&self, call: String, method: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        match state.failures.get(method) {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Vm for FakeVm {
    fn cid(&self) -> &VmCid {
        &self.cid
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        self.record("exists".into(), "exists")?;
        Ok(!lock(&self.state).missing)
    }

    async fn wait_until_ready(&self, timeout: Duration, delay: Duration) -> anyhow::Result<()> {
        lock(&self.state).ready_waits.push((timeout, delay));
        self.record("wait_until_ready".into(), "wait_until_ready")
    }

    async fn update_disks(&self, _disk_pool: &DiskPool, _stage: &dyn Stage) -> anyhow::Result<Vec<Disk>> {
        self.record("update_disks".into(), "update_disks")?;
        Ok(lock(&self.state).disks.clone())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.record("stop".into(), "stop")
    }

    async fn apply(&self, spec: &ApplySpec) -> anyhow::Result<()> {
        self.record("apply".into(), "apply")?;
        lock(&self.state).applied.push(spec.clone());
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.record("start".into(), "start")
    }

    async fn wait_to_be_running(&self, max_attempts: u32, delay: Duration) -> anyhow::Result<()> {
        lock(&self.state).running_waits.push((max_attempts, delay));
        self.record("wait_to_be_running".into(), "wait_to_be_running")
    }

    async fn attach_disk(&self, disk: &Disk) -> anyhow::Result<()> {
        self.record(format!("attach_disk:{}", disk.cid()), "attach_disk")
    }

    async fn detach_disk(&self, disk: &Disk) -> anyhow::Result<()> {
        self.record(format!("detach_disk:{}", disk.cid()), "detach_disk")
    }

    async fn disks(&self) -> anyhow::Result<Vec<Disk>> {
        self.record("disks".into(), "disks")?;
        Ok(lock(&self.state).disks.clone())
    }

    async fn unmount_disk(&self, disk: &Disk) -> anyhow::Result<()> {
        self.record(format!("unmount_disk:{}", disk.cid()), "unmount_disk")
    }

    async fn delete(&self) -> anyhow::Result<()> {
        self.record("delete".into(), "delete")?;
        match lock(&self.state).delete_error.clone() {
            Some(error_type) => Err(cpi_error("delete_vm", error_type).into()),
            None => Ok(()),
        }
    }
}

// =============================================================================
// SSH tunnel
// =============================================================================

#[derive(Default)]
struct FakeSshTunnelState {
    starts: u32,
    stops: u32,
    stopped: bool,
}

/// [`SshTunnel`] that becomes ready (or fails) as soon as it is started.
pub struct FakeSshTunnel {
    options: sshtunnel::Options,
    ready_error: Option<String>,
    state: Mutex<FakeSshTunnelState>,
}

impl FakeSshTunnel {
    pub fn options(&self) -> &sshtunnel::Options {
        &self.options
    }

    pub fn start_count(&self) -> u32 {
        lock(&self.state).starts
    }

    pub fn stop_count(&self) -> u32 {
        lock(&self.state).stops
    }
}

impl SshTunnel for FakeSshTunnel {
    fn start(&self, ready: ReadySender, _errors: ErrorSender) {
        lock(&self.state).starts += 1;
        let result = match &self.ready_error {
            Some(message) => Err(SshTunnelError::Listen(io::Error::other(message.clone()))),
            None => Ok(()),
        };
        info!(host = %self.options.host, ok = result.is_ok(), "Fake SSH tunnel started");
        let _ = ready.send(result);
    }

    fn stop(&self) -> Result<(), SshTunnelError> {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.stopped = true;
        Ok(())
    }

    fn state(&self) -> TunnelState {
        let state = lock(&self.state);
        match (state.stopped, state.starts, &self.ready_error) {
            (true, _, _) => TunnelState::Stopped,
            (false, 0, _) => TunnelState::Created,
            (false, _, Some(_)) => TunnelState::Failed,
            (false, _, None) => TunnelState::Forwarding,
        }
    }
}

/// Hands out [`FakeSshTunnel`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeSshTunnelFactory {
    ready_error: Mutex<Option<String>>,
    tunnels: Mutex<Vec<Arc<FakeSshTunnel>>>,
}

impl FakeSshTunnelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tunnels created from now on report `message` instead of ready.
    pub fn fail_ready(&self, message: &str) {
        *lock(&self.ready_error) = Some(message.to_string());
    }

    pub fn tunnels(&self) -> Vec<Arc<FakeSshTunnel>> {
        lock(&self.tunnels).clone()
    }
}

impl SshTunnelFactory for FakeSshTunnelFactory {
    fn new_ssh_tunnel(&self, options: sshtunnel::Options) -> Arc<dyn SshTunnel> {
        let tunnel = Arc::new(FakeSshTunnel {
            options,
            ready_error: lock(&self.ready_error).clone(),
            state: Mutex::default(),
        });
        lock(&self.tunnels).push(Arc::clone(&tunnel));
        tunnel
    }
}

// =============================================================================
// State builder
// =============================================================================

/// [`StateBuilder`] producing a fixed single-job state.
#[derive(Default)]
pub struct FakeStateBuilder {
    failure: Mutex<Option<String>>,
    builds: Mutex<Vec<(String, u32)>>,
}

impl FakeStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    /// `(job_name, id)` of every build.
    pub fn builds(&self) -> Vec<(String, u32)> {
        lock(&self.builds).clone()
    }
}

#[async_trait]
impl StateBuilder for FakeStateBuilder {
    async fn build(
        &self,
        job_name: &str,
        id: u32,
        manifest: &Manifest,
        _stemcell_apply_spec: &StemcellApplySpec,
    ) -> anyhow::Result<InstanceState> {
        lock(&self.builds).push((job_name.to_string(), id));
        if let Some(message) = lock(&self.failure).clone() {
            return Err(anyhow!("{message}"));
        }

        Ok(InstanceState::new(
            manifest.name.clone(),
            job_name,
            id,
            vec![NetworkRef {
                name: "default".to_string(),
                interface: serde_json::json!({"ip": "10.0.0.6"}),
            }],
            vec![JobRef {
                name: job_name.to_string(),
                version: "fake-job-version".to_string(),
            }],
            Vec::new(),
            BlobRef {
                blobstore_id: "fake-rendered-blob".to_string(),
                sha1: "fake-rendered-sha1".to_string(),
            },
        )?)
    }
}
