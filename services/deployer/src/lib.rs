//! dirboot Deployer Library
//!
//! The deployer bootstraps a single-VM director deployment. It drives a cloud
//! provider interface (CPI) and the agent running inside the VM through the
//! create, converge and delete operations of one deployment.
//!
//! ## Architecture
//!
//! ```text
//! Deployment
//! ├── Instance(job/id)   (VM lifecycle: readiness, disks, jobs, shutdown)
//! │   ├── Vm             (cloud + agent operations on one VM)
//! │   └── SshTunnel      (reverse forward to the registry, while waiting)
//! ├── Disk               (cloud disk + registry record)
//! └── CloudStemcell
//! ```
//!
//! Every externally visible operation is reported as a step on a [`Stage`].
//! A step whose target is already gone is reported as skipped and does not
//! fail the operation.
//!
//! ## Modules
//!
//! - `agentclient`: agent protocol client and the ping retryable
//! - `cloud`: CPI trait, typed CPI errors, external CPI command runner
//! - `disk`: disk handles, the SQLite disk registry and the disk manager
//! - `instance`: instance lifecycle and desired instance state
//! - `sshtunnel`: reverse SSH port forwarding
//! - `testing`: fakes for every collaborator trait
//!
//! [`Stage`]: stage::Stage

pub mod agentclient;
pub mod applyspec;
pub mod cloud;
pub mod config;
pub mod deployment;
pub mod disk;
pub mod instance;
pub mod logging;
pub mod manifest;
pub mod sshtunnel;
pub mod stage;
pub mod stemcell;
pub mod vm;

// Fakes exposed for integration tests
pub mod testing;

pub use deployment::Deployment;
pub use instance::{Instance, InstanceLifecycle, InstanceSettings};
pub use stage::{EventLoggerStage, Stage, StepError};
