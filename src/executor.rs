//! Running commands on cluster nodes
//!
//! Failure is decided by the command's exit status. Commands that legitimately
//! print nothing (`cp`, truncating a file, an empty `cat`) succeed with an
//! empty string.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{AttachParams, ListParams},
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::HarnessError;
use crate::models::{DEFAULT_HOST_ROOT, NodeRef};

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run `command` on `node` and return its stdout.
    async fn exec(&self, node: &NodeRef, command: &[&str]) -> Result<String, HarnessError>;

    /// Directory under which the node's root filesystem is visible to commands.
    fn host_root(&self) -> &str;

    /// Resolve an absolute node path against [`NodeExecutor::host_root`].
    fn host_path(&self, path: &str) -> String {
        join_host_path(self.host_root(), path)
    }
}

pub fn join_host_path(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        format!("/{}", path)
    } else {
        format!("{}/{}", root, path)
    }
}

/// Selects the per-node daemon pod commands are executed in
#[derive(Debug, Clone)]
pub struct DaemonTarget {
    pub namespace: String,
    pub label_selector: String,
    pub container: Option<String>,
    pub host_root: String,
}

impl DaemonTarget {
    /// machine-config-daemon: privileged, host filesystem mounted at /rootfs
    pub fn machine_config_daemon() -> Self {
        Self {
            namespace: "openshift-machine-config-operator".to_string(),
            label_selector: "k8s-app=machine-config-daemon".to_string(),
            container: Some("machine-config-daemon".to_string()),
            host_root: DEFAULT_HOST_ROOT.to_string(),
        }
    }

    /// the TuneD daemon pod of the node tuning operator
    pub fn tuned() -> Self {
        Self {
            namespace: "openshift-cluster-node-tuning-operator".to_string(),
            label_selector: "openshift-app=tuned".to_string(),
            container: None,
            host_root: "/host".to_string(),
        }
    }
}

/// Executes commands inside the daemon pod scheduled on the target node
pub struct DaemonPodExecutor {
    client: Client,
    target: DaemonTarget,
}

impl DaemonPodExecutor {
    pub fn new(client: Client, target: DaemonTarget) -> Self {
        Self { client, target }
    }

    pub fn target(&self) -> &DaemonTarget {
        &self.target
    }

    /// Find the running daemon pod on `node`
    pub async fn find_pod(&self, node: &NodeRef) -> Result<Pod, HarnessError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.target.namespace);
        let lp = ListParams::default()
            .labels(&self.target.label_selector)
            .fields(&format!("spec.nodeName={}", node.name()));

        let pod_list = pods.list(&lp).await?;
        pod_list
            .items
            .into_iter()
            .find(|pod| {
                pod.metadata.deletion_timestamp.is_none()
                    && pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        .is_some_and(|phase| phase == "Running")
            })
            .ok_or_else(|| HarnessError::CommandFailed {
                node: node.name().to_string(),
                command: String::new(),
                message: format!(
                    "no running pod matching {:?} in namespace {}",
                    self.target.label_selector, self.target.namespace
                ),
            })
    }
}

#[async_trait]
impl NodeExecutor for DaemonPodExecutor {
    async fn exec(&self, node: &NodeRef, command: &[&str]) -> Result<String, HarnessError> {
        let pod = self.find_pod(node).await?;
        let pod_name = pod.metadata.name.unwrap_or_default();
        let rendered = command.join(" ");
        debug!("exec on {} via {}: {}", node, pod_name, rendered);

        let failed = |message: String| HarnessError::CommandFailed {
            node: node.name().to_string(),
            command: rendered.clone(),
            message,
        };

        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(container) = &self.target.container {
            params = params.container(container.clone());
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.target.namespace);
        let mut attached = pods
            .exec(&pod_name, command.iter().copied(), &params)
            .await?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
        let stdout = stdout?;
        let stderr = stderr?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| failed(format!("exec session error: {}", e)))?;

        match status {
            Some(status) if status.status.as_deref() == Some("Failure") => {
                let message = status.message.unwrap_or_else(|| "command failed".to_string());
                Err(failed(format!("{}: {}", message, stderr.trim())))
            }
            _ => {
                debug!("{} output: {:?}", rendered, stdout);
                Ok(stdout)
            }
        }
    }

    fn host_root(&self) -> &str {
        &self.target.host_root
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut buf).await?;
    }
    Ok(buf)
}

/// Runs commands as local processes, for on-node runs and tests
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    host_root: String,
}

impl LocalExecutor {
    pub fn new(host_root: impl Into<String>) -> Self {
        Self {
            host_root: host_root.into(),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new("/")
    }
}

#[async_trait]
impl NodeExecutor for LocalExecutor {
    async fn exec(&self, node: &NodeRef, command: &[&str]) -> Result<String, HarnessError> {
        let rendered = command.join(" ");
        let Some((program, args)) = command.split_first() else {
            return Err(HarnessError::CommandFailed {
                node: node.name().to_string(),
                command: rendered,
                message: "empty command".to_string(),
            });
        };

        debug!("exec locally for {}: {}", node, rendered);
        let output = Command::new(program).args(args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() {
            return Err(HarnessError::CommandFailed {
                node: node.name().to_string(),
                command: rendered,
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(stdout)
    }

    fn host_root(&self) -> &str {
        &self.host_root
    }
}
