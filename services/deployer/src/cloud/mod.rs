//! Cloud provider interface.
//!
//! The deployer only needs the handful of CPI methods used while converging
//! and tearing down a single VM. Errors carry the CPI's error type so callers
//! can tell "already gone" apart from real failures.

mod cpi;

use async_trait::async_trait;
use dirboot_id::{DiskCid, StemcellCid, VmCid};
use thiserror::Error;

use crate::stage::StepError;

pub use cpi::CpiCmdRunner;

/// Free-form IaaS settings passed through to the CPI.
pub type CloudProperties = serde_json::Map<String, serde_json::Value>;

/// Error type reported by the CPI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudErrorType {
    VmNotFound,
    DiskNotFound,
    StemcellNotFound,
    Other(String),
}

impl CloudErrorType {
    pub const VM_NOT_FOUND: &'static str = "Bosh::Clouds::VMNotFound";
    pub const DISK_NOT_FOUND: &'static str = "Bosh::Clouds::DiskNotFound";
    pub const STEMCELL_NOT_FOUND: &'static str = "Bosh::Clouds::StemcellNotFound";

    pub fn parse(s: &str) -> Self {
        match s {
            Self::VM_NOT_FOUND => Self::VmNotFound,
            Self::DISK_NOT_FOUND => Self::DiskNotFound,
            Self::STEMCELL_NOT_FOUND => Self::StemcellNotFound,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::VmNotFound => Self::VM_NOT_FOUND,
            Self::DiskNotFound => Self::DISK_NOT_FOUND,
            Self::StemcellNotFound => Self::STEMCELL_NOT_FOUND,
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for CloudErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from CPI calls.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("CPI '{method}' method responded with error: {error_type}: {message}")]
    Cpi {
        method: String,
        error_type: CloudErrorType,
        message: String,
        ok_to_retry: bool,
    },

    #[error("Executing CPI command for '{method}'")]
    Exec {
        method: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid CPI response for '{method}': {reason}")]
    InvalidResponse { method: String, reason: String },
}

impl CloudError {
    /// The CPI-reported error type, if the CPI got far enough to report one.
    pub fn error_type(&self) -> Option<&CloudErrorType> {
        match self {
            CloudError::Cpi { error_type, .. } => Some(error_type),
            _ => None,
        }
    }

    pub fn is(&self, error_type: &CloudErrorType) -> bool {
        self.error_type() == Some(error_type)
    }
}

/// CPI operations used by the deployer.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn has_vm(&self, vm_cid: &VmCid) -> Result<bool, CloudError>;

    async fn delete_vm(&self, vm_cid: &VmCid) -> Result<(), CloudError>;

    /// Creates a disk of `size` MB near the given VM.
    async fn create_disk(
        &self,
        size: u64,
        cloud_properties: &CloudProperties,
        vm_cid: &VmCid,
    ) -> Result<DiskCid, CloudError>;

    async fn attach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<(), CloudError>;

    async fn detach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<(), CloudError>;

    async fn delete_disk(&self, disk_cid: &DiskCid) -> Result<(), CloudError>;

    async fn delete_stemcell(&self, stemcell_cid: &StemcellCid) -> Result<(), CloudError>;
}

/// Turns a not-found error of the given type into a skipped step.
///
/// The cloud error may be wrapped in any amount of context.
pub fn skip_if_not_found(result: anyhow::Result<()>, not_found: CloudErrorType) -> Result<(), StepError> {
    let err = match result {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    match err.downcast_ref::<CloudError>() {
        Some(cloud_err) if cloud_err.is(&not_found) => Err(StepError::Skipped(cloud_err.to_string())),
        _ => Err(StepError::Failed(err)),
    }
}
