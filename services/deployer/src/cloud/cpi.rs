//! External CPI executable.
//!
//! Each call runs the CPI once: the request goes to stdin as JSON and the
//! response is read back from stdout.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use dirboot_id::{DiskCid, StemcellCid, VmCid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Cloud, CloudError, CloudErrorType, CloudProperties};

#[derive(Debug, Serialize)]
struct CpiRequest<'a> {
    method: &'a str,
    arguments: Vec<Value>,
    context: CpiContext<'a>,
}

#[derive(Debug, Serialize)]
struct CpiContext<'a> {
    director_uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct CpiResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<CpiResponseError>,
    #[serde(default)]
    log: String,
}

#[derive(Debug, Deserialize)]
struct CpiResponseError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
    #[serde(default)]
    ok_to_retry: bool,
}

/// [`Cloud`] backed by a CPI executable.
#[derive(Debug, Clone)]
pub struct CpiCmdRunner {
    cpi_path: PathBuf,
    args: Vec<String>,
    director_uuid: String,
}

impl CpiCmdRunner {
    pub fn new(cpi_path: impl Into<PathBuf>, director_uuid: impl Into<String>) -> Self {
        Self {
            cpi_path: cpi_path.into(),
            args: Vec::new(),
            director_uuid: director_uuid.into(),
        }
    }

    /// Arguments passed to the executable ahead of the request.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Runs one CPI method and returns its `result`.
    pub async fn call(&self, method: &str, arguments: Vec<Value>) -> Result<Value, CloudError> {
        let exec_err = |source: std::io::Error| CloudError::Exec {
            method: method.to_string(),
            source,
        };

        let request = CpiRequest {
            method,
            arguments,
            context: CpiContext {
                director_uuid: &self.director_uuid,
            },
        };
        let payload = serde_json::to_vec(&request).map_err(|e| CloudError::InvalidResponse {
            method: method.to_string(),
            reason: format!("encoding request: {e}"),
        })?;

        debug!(cpi = %self.cpi_path.display(), method, "Calling CPI");

        let mut child = Command::new(&self.cpi_path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(exec_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(exec_err)?;
            // Closing stdin signals the end of the request.
            drop(stdin);
        }

        let output = child.wait_with_output().await.map_err(exec_err)?;

        if !output.stderr.is_empty() {
            debug!(method, stderr = %String::from_utf8_lossy(&output.stderr), "CPI stderr");
        }

        let response: CpiResponse = serde_json::from_slice(&output.stdout).map_err(|e| {
            warn!(method, status = %output.status, "Unparseable CPI response");
            CloudError::InvalidResponse {
                method: method.to_string(),
                reason: format!("{e} (exit status {})", output.status),
            }
        })?;

        if !response.log.is_empty() {
            debug!(method, log = %response.log, "CPI log");
        }

        if let Some(error) = response.error {
            return Err(CloudError::Cpi {
                method: method.to_string(),
                error_type: CloudErrorType::parse(&error.error_type),
                message: error.message,
                ok_to_retry: error.ok_to_retry,
            });
        }

        Ok(response.result)
    }

    async fn call_unit(&self, method: &str, arguments: Vec<Value>) -> Result<(), CloudError> {
        self.call(method, arguments).await.map(|_| ())
    }
}

fn invalid(method: &str, reason: impl Into<String>) -> CloudError {
    CloudError::InvalidResponse {
        method: method.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl Cloud for CpiCmdRunner {
    async fn has_vm(&self, vm_cid: &VmCid) -> Result<bool, CloudError> {
        let result = self.call("has_vm", vec![json!(vm_cid)]).await?;
        result
            .as_bool()
            .ok_or_else(|| invalid("has_vm", format!("expected a boolean, got {result}")))
    }

    async fn delete_vm(&self, vm_cid: &VmCid) -> Result<(), CloudError> {
        self.call_unit("delete_vm", vec![json!(vm_cid)]).await
    }

    async fn create_disk(
        &self,
        size: u64,
        cloud_properties: &CloudProperties,
        vm_cid: &VmCid,
    ) -> Result<DiskCid, CloudError> {
        let result = self
            .call("create_disk", vec![json!(size), json!(cloud_properties), json!(vm_cid)])
            .await?;

        let cid = result
            .as_str()
            .ok_or_else(|| invalid("create_disk", format!("expected a disk CID, got {result}")))?;
        DiskCid::parse(cid).map_err(|e| invalid("create_disk", e.to_string()))
    }

    async fn attach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<(), CloudError> {
        self.call_unit("attach_disk", vec![json!(vm_cid), json!(disk_cid)])
            .await
    }

    async fn detach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<(), CloudError> {
        self.call_unit("detach_disk", vec![json!(vm_cid), json!(disk_cid)])
            .await
    }

    async fn delete_disk(&self, disk_cid: &DiskCid) -> Result<(), CloudError> {
        self.call_unit("delete_disk", vec![json!(disk_cid)]).await
    }

    async fn delete_stemcell(&self, stemcell_cid: &StemcellCid) -> Result<(), CloudError> {
        self.call_unit("delete_stemcell", vec![json!(stemcell_cid)])
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;

    /// CPI stand-in: records the request next to itself and prints `response`.
    fn fake_cpi(dir: &Path, response: &str) -> CpiCmdRunner {
        let script = dir.join("cpi.sh");
        let request = dir.join("request.json");
        std::fs::write(
            &script,
            format!(
                "cat > '{}'\nprintf '%s' '{}'\n",
                request.display(),
                response
            ),
        )
        .unwrap();

        CpiCmdRunner::new("/bin/sh", "fake-director-uuid")
            .with_args(vec![script.display().to_string()])
    }

    fn recorded_request(dir: &Path) -> Value {
        let raw = std::fs::read_to_string(dir.join("request.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_create_disk_request_and_result() {
        let dir = TempDir::new().unwrap();
        let cpi = fake_cpi(dir.path(), r#"{"result":"vol-123","error":null,"log":""}"#);

        let mut props = CloudProperties::new();
        props.insert("type".into(), json!("gp3"));
        let vm = VmCid::parse("i-abc").unwrap();

        let cid = cpi.create_disk(1024, &props, &vm).await.unwrap();
        assert_eq!(cid.as_str(), "vol-123");

        let request = recorded_request(dir.path());
        assert_eq!(request["method"], "create_disk");
        assert_eq!(request["arguments"], json!([1024, {"type": "gp3"}, "i-abc"]));
        assert_eq!(request["context"]["director_uuid"], "fake-director-uuid");
    }

    #[tokio::test]
    async fn test_not_found_error_type() {
        let dir = TempDir::new().unwrap();
        let cpi = fake_cpi(
            dir.path(),
            r#"{"result":null,"error":{"type":"Bosh::Clouds::DiskNotFound","message":"disk vol-1 not found","ok_to_retry":false},"log":""}"#,
        );

        let err = cpi
            .delete_disk(&DiskCid::parse("vol-1").unwrap())
            .await
            .unwrap_err();

        assert!(err.is(&CloudErrorType::DiskNotFound));
        assert!(err.to_string().contains("disk vol-1 not found"));
    }

    #[tokio::test]
    async fn test_has_vm() {
        let dir = TempDir::new().unwrap();
        let cpi = fake_cpi(dir.path(), r#"{"result":false,"error":null,"log":"checked"}"#);

        assert!(!cpi.has_vm(&VmCid::parse("i-abc").unwrap()).await.unwrap());
        assert_eq!(recorded_request(dir.path())["method"], "has_vm");
    }

    #[tokio::test]
    async fn test_garbage_response() {
        let dir = TempDir::new().unwrap();
        let cpi = fake_cpi(dir.path(), "not json");

        let err = cpi
            .delete_vm(&VmCid::parse("i-abc").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::InvalidResponse { .. }));
        assert_eq!(err.error_type(), None);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let cpi = CpiCmdRunner::new("/nonexistent/cpi", "fake-director-uuid");

        let err = cpi
            .delete_stemcell(&StemcellCid::parse("ami-1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Exec { .. }));
    }
}
