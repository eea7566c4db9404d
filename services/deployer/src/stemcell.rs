//! Uploaded stemcells.

use std::collections::BTreeMap;
use std::sync::Arc;

use dirboot_id::StemcellCid;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::applyspec::{Blob, Job};
use crate::cloud::Cloud;

/// Apply spec baked into a stemcell, merged into each instance's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellApplySpec {
    #[serde(default)]
    pub job: Job,

    #[serde(default)]
    pub packages: BTreeMap<String, Blob>,
}

/// Handle to a stemcell image uploaded to the cloud.
#[derive(Clone)]
pub struct CloudStemcell {
    cid: StemcellCid,
    name: String,
    version: String,
    cloud: Arc<dyn Cloud>,
}

impl std::fmt::Debug for CloudStemcell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStemcell")
            .field("cid", &self.cid)
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CloudStemcell {
    pub fn new(
        cid: StemcellCid,
        name: impl Into<String>,
        version: impl Into<String>,
        cloud: Arc<dyn Cloud>,
    ) -> Self {
        Self {
            cid,
            name: name.into(),
            version: version.into(),
            cloud,
        }
    }

    pub fn cid(&self) -> &StemcellCid {
        &self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Deletes the image. Errors are returned as the cloud reported them.
    pub async fn delete(&self) -> anyhow::Result<()> {
        self.cloud.delete_stemcell(&self.cid).await?;
        info!(stemcell_cid = %self.cid, name = %self.name, version = %self.version, "Deleted stemcell");
        Ok(())
    }
}
