//! Desired state of one instance.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dirboot_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use crate::applyspec::{ApplySpec, Blob, Job, RenderedTemplatesArchive};
use crate::manifest::Manifest;
use crate::stemcell::StemcellApplySpec;

/// A deployment network and the interface the instance uses on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRef {
    pub name: String,
    pub interface: serde_json::Value,
}

/// A rendered job. Its archive is part of the rendered job list archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub name: String,
    pub version: String,
}

/// A compiled package uploaded to the blobstore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
    pub archive: BlobRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub blobstore_id: String,
    pub sha1: String,
}

/// Everything the agent needs to run one instance's jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    deployment_name: String,
    job_name: String,
    id: u32,
    networks: Vec<NetworkRef>,
    rendered_jobs: Vec<JobRef>,
    compiled_packages: Vec<PackageRef>,
    rendered_job_list_archive: BlobRef,
    configuration_hash: SpecHash,
}

impl InstanceState {
    /// Builds the state and fingerprints it.
    ///
    /// The configuration hash covers the whole apply spec, so any change in
    /// networks, jobs or packages produces a new hash.
    pub fn new(
        deployment_name: impl Into<String>,
        job_name: impl Into<String>,
        id: u32,
        networks: Vec<NetworkRef>,
        rendered_jobs: Vec<JobRef>,
        compiled_packages: Vec<PackageRef>,
        rendered_job_list_archive: BlobRef,
    ) -> serde_json::Result<Self> {
        let mut state = Self {
            deployment_name: deployment_name.into(),
            job_name: job_name.into(),
            id,
            networks,
            rendered_jobs,
            compiled_packages,
            rendered_job_list_archive,
            configuration_hash: SpecHash::from_json(&serde_json::Value::Null),
        };

        let unhashed = serde_json::to_value(state.apply_spec_with_hash(String::new()))?;
        state.configuration_hash = SpecHash::from_json(&unhashed);
        Ok(state)
    }

    pub fn network_interfaces(&self) -> &[NetworkRef] {
        &self.networks
    }

    pub fn rendered_jobs(&self) -> &[JobRef] {
        &self.rendered_jobs
    }

    pub fn compiled_packages(&self) -> &[PackageRef] {
        &self.compiled_packages
    }

    pub fn rendered_job_list_archive(&self) -> &BlobRef {
        &self.rendered_job_list_archive
    }

    pub fn configuration_hash(&self) -> &SpecHash {
        &self.configuration_hash
    }

    pub fn to_apply_spec(&self) -> ApplySpec {
        self.apply_spec_with_hash(self.configuration_hash.to_string())
    }

    fn apply_spec_with_hash(&self, configuration_hash: String) -> ApplySpec {
        let templates = self
            .rendered_jobs
            .iter()
            .map(|job| Blob {
                name: job.name.clone(),
                version: job.version.clone(),
                ..Default::default()
            })
            .collect();

        let packages: BTreeMap<String, Blob> = self
            .compiled_packages
            .iter()
            .map(|pkg| {
                let blob = Blob {
                    name: pkg.name.clone(),
                    version: pkg.version.clone(),
                    sha1: pkg.archive.sha1.clone(),
                    blobstore_id: pkg.archive.blobstore_id.clone(),
                };
                (pkg.name.clone(), blob)
            })
            .collect();

        let networks = self
            .networks
            .iter()
            .map(|net| (net.name.clone(), net.interface.clone()))
            .collect();

        ApplySpec {
            deployment: self.deployment_name.clone(),
            index: self.id,
            networks,
            job: Job {
                name: self.job_name.clone(),
                templates,
            },
            packages,
            rendered_templates_archive: RenderedTemplatesArchive {
                blobstore_id: self.rendered_job_list_archive.blobstore_id.clone(),
                sha1: self.rendered_job_list_archive.sha1.clone(),
            },
            configuration_hash,
        }
    }
}

/// Renders jobs, compiles packages and uploads both for one instance.
#[async_trait]
pub trait StateBuilder: Send + Sync {
    async fn build(
        &self,
        job_name: &str,
        id: u32,
        manifest: &Manifest,
        stemcell_apply_spec: &StemcellApplySpec,
    ) -> anyhow::Result<InstanceState>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn state(packages: Vec<PackageRef>) -> InstanceState {
        InstanceState::new(
            "bosh",
            "director",
            0,
            vec![NetworkRef {
                name: "default".into(),
                interface: json!({"ip": "10.0.0.6", "type": "manual"}),
            }],
            vec![
                JobRef {
                    name: "nats".into(),
                    version: "a1".into(),
                },
                JobRef {
                    name: "director".into(),
                    version: "b2".into(),
                },
            ],
            packages,
            BlobRef {
                blobstore_id: "rendered-blob".into(),
                sha1: "rendered-sha1".into(),
            },
        )
        .unwrap()
    }

    fn ruby() -> PackageRef {
        PackageRef {
            name: "ruby".into(),
            version: "2.1".into(),
            archive: BlobRef {
                blobstore_id: "ruby-blob".into(),
                sha1: "ruby-sha1".into(),
            },
        }
    }

    #[test]
    fn test_to_apply_spec() {
        let spec = state(vec![ruby()]).to_apply_spec();

        assert_eq!(spec.deployment, "bosh");
        assert_eq!(spec.index, 0);
        assert_eq!(spec.job.name, "director");
        assert_eq!(
            spec.job.templates.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["nats", "director"]
        );
        assert_eq!(spec.packages["ruby"].blobstore_id, "ruby-blob");
        assert_eq!(spec.packages["ruby"].sha1, "ruby-sha1");
        assert_eq!(spec.networks["default"]["ip"], "10.0.0.6");
        assert_eq!(spec.rendered_templates_archive.blobstore_id, "rendered-blob");
        assert_eq!(spec.configuration_hash.len(), 64);
    }

    #[test]
    fn test_hash_follows_content() {
        assert_eq!(
            state(vec![ruby()]).configuration_hash(),
            state(vec![ruby()]).configuration_hash()
        );
        assert_ne!(
            state(vec![ruby()]).configuration_hash(),
            state(Vec::new()).configuration_hash()
        );
    }
}
