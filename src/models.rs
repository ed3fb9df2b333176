use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::cpuset::CpuSet;
use crate::poll::Poller;

pub const TARGET_NODE_ENV: &str = "E2E_PAO_TARGET_NODE";
pub const ROLE_ENV: &str = "ROLE_WORKER_CNF";
pub const DISCOVERY_MODE_ENV: &str = "DISCOVERY_MODE";

pub const DEFAULT_ROLE: &str = "worker-cnf";
pub const WORKER_POOL: &str = "worker";
pub const DEFAULT_HOST_ROOT: &str = "/rootfs";
pub const DEFAULT_TEST_IMAGE: &str = "quay.io/openshift-kni/cnf-tests:4.11";
pub const DEFAULT_TEST_EXECUTABLE: &str = "../../../../../build/_output/bin/latency-e2e.test";

/// Handle to a cluster node reachable for command execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    name: String,
}

impl NodeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<&Node> for NodeRef {
    fn from(node: &Node) -> Self {
        Self::new(node.metadata.name.clone().unwrap_or_default())
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMode {
    Enabled,
    Disabled,
}

impl DiscoveryMode {
    pub fn from_env() -> Self {
        match std::env::var(DISCOVERY_MODE_ENV) {
            Ok(value) if value.eq_ignore_ascii_case("true") => Self::Enabled,
            _ => Self::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupMode {
    Cleanup,
    NoCleanup,
}

impl CleanupMode {
    pub fn should_cleanup(&self) -> bool {
        matches!(self, Self::Cleanup)
    }
}

/// Timeouts for the convergence waits used by the suites
#[derive(Debug, Clone, Copy)]
pub struct WaitSettings {
    pub pod_ready: Poller,
    pub pod_deletion: Poller,
    pub tuned_restart: Poller,
    pub banned_cpus: Poller,
    pub namespace_deletion: Poller,
    pub daemonset_ready: Poller,
    pub machine_config_pool: Poller,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            pod_ready: Poller::new(Duration::from_secs(5), Duration::from_secs(600)),
            pod_deletion: Poller::new(Duration::from_secs(2), Duration::from_secs(120)),
            tuned_restart: Poller::new(Duration::from_secs(10), Duration::from_secs(300)),
            banned_cpus: Poller::new(Duration::from_secs(10), Duration::from_secs(300)),
            namespace_deletion: Poller::new(Duration::from_secs(5), Duration::from_secs(300)),
            daemonset_ready: Poller::new(Duration::from_secs(10), Duration::from_secs(600)),
            machine_config_pool: Poller::new(Duration::from_secs(30), Duration::from_secs(1800)),
        }
    }
}

/// Configuration shared by both suites
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// worker role whose nodes are tuned by the profile under test
    pub role: String,
    /// node name hint, usually taken from `E2E_PAO_TARGET_NODE`
    pub target_node: Option<String>,
    pub discovery: DiscoveryMode,
    pub test_image: String,
    pub test_namespace: String,
    pub test_executable: PathBuf,
    pub prepull_namespace: String,
    pub cleanup_mode: CleanupMode,
    pub waits: WaitSettings,
}

impl HarnessConfig {
    /// read the environment-driven settings on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(role) = std::env::var(ROLE_ENV)
            && !role.is_empty()
        {
            config.role = role;
        }
        config.target_node = std::env::var(TARGET_NODE_ENV).ok();
        config.discovery = DiscoveryMode::from_env();
        config
    }

    /// label selector matching the worker nodes of the configured role
    pub fn node_selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            format!("node-role.kubernetes.io/{}", self.role),
            String::new(),
        )])
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            role: DEFAULT_ROLE.to_string(),
            target_node: None,
            discovery: DiscoveryMode::Disabled,
            test_image: DEFAULT_TEST_IMAGE.to_string(),
            test_namespace: "default".to_string(),
            test_executable: PathBuf::from(DEFAULT_TEST_EXECUTABLE),
            prepull_namespace: "testing-prepull".to_string(),
            cleanup_mode: CleanupMode::Cleanup,
            waits: WaitSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStatus::Passed => write!(f, "Passed"),
            ScenarioStatus::Failed => write!(f, "Failed"),
            ScenarioStatus::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Result of a single scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub status: ScenarioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Conclusion of a scenario body that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Skipped(String),
}

impl ScenarioOutcome {
    pub fn from_result(
        name: &str,
        node: Option<&NodeRef>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        result: &anyhow::Result<Verdict>,
    ) -> Self {
        let (status, detail) = match result {
            Ok(Verdict::Passed) => (ScenarioStatus::Passed, None),
            Ok(Verdict::Skipped(reason)) => (ScenarioStatus::Skipped, Some(reason.clone())),
            Err(e) => (ScenarioStatus::Failed, Some(format!("{:#}", e))),
        };

        Self {
            name: name.to_string(),
            status,
            node: node.map(|n| n.name().to_string()),
            detail,
            started_at,
            duration_secs: elapsed.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_url: Option<String>,
    pub scenarios: Vec<ScenarioOutcome>,
}

impl SuiteReport {
    pub fn new(suite: &str, api_server_url: Option<String>) -> Self {
        Self {
            suite: suite.to_string(),
            api_server_url,
            scenarios: Vec::new(),
        }
    }

    pub fn count(&self, status: ScenarioStatus) -> usize {
        self.scenarios.iter().filter(|s| s.status == status).count()
    }

    pub fn succeeded(&self) -> bool {
        self.count(ScenarioStatus::Failed) == 0
    }
}

/// IRQ-related state of one node, as printed by `node-state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateReport {
    pub node: String,
    pub banned_cpus: CpuSet,
    pub default_smp_affinity: String,
    pub default_smp_affinity_cpus: CpuSet,
    pub online_cpus: CpuSet,
    /// default affinity still spans every online CPU
    pub pristine: bool,
    /// `None` when the saved ban list could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orig_banned_cpus_empty: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_node_ref_from_node() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(NodeRef::from(&node).name(), "worker-0");
    }

    #[test]
    fn test_node_selector_labels() {
        let config = HarnessConfig::default();
        let labels = config.node_selector_labels();
        assert_eq!(
            labels.get("node-role.kubernetes.io/worker-cnf"),
            Some(&String::new())
        );
    }

    #[test]
    fn test_report_counts() {
        let mut report = SuiteReport::new("irqbalance", None);
        for status in [
            ScenarioStatus::Passed,
            ScenarioStatus::Skipped,
            ScenarioStatus::Passed,
        ] {
            report.scenarios.push(ScenarioOutcome {
                name: "x".to_string(),
                status,
                node: None,
                detail: None,
                started_at: Utc::now(),
                duration_secs: 0.0,
            });
        }
        assert_eq!(report.count(ScenarioStatus::Passed), 2);
        assert!(report.succeeded());
    }

    #[test]
    fn test_outcome_from_result() {
        let node = NodeRef::new("worker-0");
        let failed: anyhow::Result<Verdict> =
            Err(anyhow::anyhow!("banned CPUs changed").context("after tuned restart"));
        let outcome = ScenarioOutcome::from_result(
            "tuned-restart-keeps-banned-cpus",
            Some(&node),
            Utc::now(),
            Duration::from_millis(1500),
            &failed,
        );
        assert_eq!(outcome.status, ScenarioStatus::Failed);
        assert_eq!(
            outcome.detail.as_deref(),
            Some("after tuned restart: banned CPUs changed")
        );
        assert_eq!(outcome.node.as_deref(), Some("worker-0"));
        assert_eq!(outcome.duration_secs, 1.5);

        let skipped = Ok(Verdict::Skipped("runtime class not generated".to_string()));
        let outcome = ScenarioOutcome::from_result("x", None, Utc::now(), Duration::ZERO, &skipped);
        assert_eq!(outcome.status, ScenarioStatus::Skipped);
    }
}
