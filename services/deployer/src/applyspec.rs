//! Apply spec: the desired-state document pushed to the agent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplySpec {
    pub deployment: String,
    pub index: u32,
    pub networks: BTreeMap<String, serde_json::Value>,
    pub job: Job,
    pub packages: BTreeMap<String, Blob>,
    pub rendered_templates_archive: RenderedTemplatesArchive,
    pub configuration_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub templates: Vec<Blob>,
}

/// A named, versioned blob in the blobstore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha1: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blobstore_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplatesArchive {
    pub blobstore_id: String,
    pub sha1: String,
}
