//! # dirboot-id
//!
//! Identifier types shared across the dirboot workspace.
//!
//! Two families of IDs live here:
//!
//! - **Record IDs** are minted locally for rows in the deployment state
//!   store. They use a prefixed ULID format (`disk_01HV4Z2WQXKJNM8GPQY6VBKC3D`)
//!   so they sort by creation time and cannot be confused across tables.
//! - **Cloud IDs (CIDs)** are handed out by the cloud provider interface.
//!   Their format is owned by the infrastructure backend, so they are opaque
//!   non-empty strings wrapped in distinct types (`VmCid`, `DiskCid`,
//!   `StemcellCid`) to keep a disk CID from being passed where a VM CID is
//!   expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
