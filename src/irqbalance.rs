//! Checks of the irqbalance CPU ban list handling on tuned nodes
//!
//! The ban list lives in `/etc/sysconfig/irqbalance` and is owned by CRI-O,
//! which narrows it for pods asking for IRQ isolation. `orig_irq_banned_cpus`
//! is the copy CRI-O takes once at startup and restores from on restart.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::backup::with_backups;
use crate::cluster;
use crate::cpuset::CpuSet;
use crate::error::HarnessError;
use crate::executor::{DaemonPodExecutor, DaemonTarget, NodeExecutor};
use crate::mcp;
use crate::models::{
    HarnessConfig, NodeRef, ScenarioOutcome, SuiteReport, Verdict, WORKER_POOL, WaitSettings,
};
use crate::node_selector::pick_node;
use crate::node_state::{IRQBALANCE_CONF, NodeInspector, ORIG_BANNED_CPUS};
use crate::pods;
use crate::poll::Poller;
use crate::profile::{self, PerformanceProfile};

pub const SUITE_NAME: &str = "irqbalance";
pub const TUNED_PID_FILE: &str = "/run/tuned/tuned.pid";
/// ban list written before the CRI-O restart; any value works as long as it differs
pub const FAKE_BANNED_CPUS: &str = "IRQBALANCE_BANNED_CPUS=2,3";
/// smallest request that is reasonably SMT-aligned
const TEST_POD_CPUS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    TunedRestartKeepsBannedCpus,
    BackupHoldsEmptyMask,
    CrioRestartRewritesBannedCpus,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [
        Scenario::TunedRestartKeepsBannedCpus,
        Scenario::BackupHoldsEmptyMask,
        Scenario::CrioRestartRewritesBannedCpus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::TunedRestartKeepsBannedCpus => "tuned-restart-keeps-banned-cpus",
            Scenario::BackupHoldsEmptyMask => "backup-holds-empty-mask",
            Scenario::CrioRestartRewritesBannedCpus => "crio-restart-rewrites-banned-cpus",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Scenario::ALL.iter().map(|s| s.name()).collect();
                format!("unknown scenario {:?}, expected one of {}", s, known.join(", "))
            })
    }
}

/// Per-scenario target, established before each scenario runs
pub struct TargetContext {
    pub profile: PerformanceProfile,
    pub node: NodeRef,
}

/// Cluster operations the suite needs besides running commands on the node
#[async_trait]
pub trait SuiteCluster: Send + Sync {
    async fn find_profile(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Option<PerformanceProfile>>;

    /// wait until the worker pool and the pool of `profile` are both updated
    async fn wait_pools_updated(&self, profile: &PerformanceProfile) -> Result<()>;

    async fn candidate_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<NodeRef>>;

    /// create `pod`, returning the name it was given
    async fn create_pod(&self, pod: &Pod) -> Result<String>;

    async fn wait_pod_ready(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// delete the TuneD pod of `node` so its DaemonSet starts a new one
    async fn delete_tuned_pod(&self, node: &NodeRef) -> Result<()>;
}

/// [`SuiteCluster`] backed by the Kubernetes API
pub struct KubeCluster {
    client: Client,
    waits: WaitSettings,
    tuned: DaemonPodExecutor,
}

impl KubeCluster {
    pub fn new(client: Client, waits: WaitSettings) -> Self {
        let tuned = DaemonPodExecutor::new(client.clone(), DaemonTarget::tuned());
        Self {
            client,
            waits,
            tuned,
        }
    }
}

#[async_trait]
impl SuiteCluster for KubeCluster {
    async fn find_profile(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Option<PerformanceProfile>> {
        profile::find_by_node_labels(&self.client, labels).await
    }

    async fn wait_pools_updated(&self, profile: &PerformanceProfile) -> Result<()> {
        let pool = mcp::pool_for_profile(&self.client, profile).await?;
        for name in [WORKER_POOL, pool.as_str()] {
            mcp::wait_for_condition(
                &self.client,
                name,
                mcp::CONDITION_UPDATED,
                "True",
                self.waits.machine_config_pool,
            )
            .await?;
        }
        Ok(())
    }

    async fn candidate_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<NodeRef>> {
        let nodes = cluster::nodes_by_labels(&self.client, labels).await?;
        Ok(cluster::node_refs(&nodes))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<String> {
        Ok(pods::create_pod(&self.client, pod).await?.name_any())
    }

    async fn wait_pod_ready(&self, namespace: &str, name: &str) -> Result<()> {
        let ready =
            pods::wait_for_pod_ready(&self.client, namespace, name, self.waits.pod_ready).await;
        if let Err(e) = pods::log_pod_events(&self.client, namespace, name).await {
            warn!("{:#}", e);
        }
        ready.map(|_| ())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        pods::delete_pod_and_wait(&self.client, namespace, name, self.waits.pod_deletion).await
    }

    async fn delete_tuned_pod(&self, node: &NodeRef) -> Result<()> {
        let tuned_pod = self.tuned.find_pod(node).await?;
        pods::delete_pod_and_wait(
            &self.client,
            &self.tuned.target().namespace,
            &tuned_pod.name_any(),
            self.waits.pod_deletion,
        )
        .await
    }
}

pub struct IrqBalanceSuite {
    cluster: Arc<dyn SuiteCluster>,
    config: HarnessConfig,
    api_server_url: Option<String>,
    inspector: NodeInspector,
    tuned: Arc<dyn NodeExecutor>,
}

impl IrqBalanceSuite {
    pub fn new(client: Client, config: HarnessConfig, api_server_url: Option<String>) -> Self {
        let executor: Arc<dyn NodeExecutor> = Arc::new(DaemonPodExecutor::new(
            client.clone(),
            DaemonTarget::machine_config_daemon(),
        ));
        let tuned: Arc<dyn NodeExecutor> = Arc::new(DaemonPodExecutor::new(
            client.clone(),
            DaemonTarget::tuned(),
        ));
        let cluster = Arc::new(KubeCluster::new(client, config.waits));

        Self::with_parts(cluster, NodeInspector::new(executor), tuned, config, api_server_url)
    }

    /// Assemble a suite from its parts; `tuned` runs commands in the TuneD pod
    pub fn with_parts(
        cluster: Arc<dyn SuiteCluster>,
        inspector: NodeInspector,
        tuned: Arc<dyn NodeExecutor>,
        config: HarnessConfig,
        api_server_url: Option<String>,
    ) -> Self {
        Self {
            cluster,
            config,
            api_server_url,
            inspector,
            tuned,
        }
    }

    /// Run `scenarios` in order; a failing scenario does not stop the next one
    pub async fn run(&self, scenarios: &[Scenario]) -> SuiteReport {
        let mut report = SuiteReport::new(SUITE_NAME, self.api_server_url.clone());

        for scenario in scenarios {
            info!("running scenario {}", scenario);
            let started_at = Utc::now();
            let started = Instant::now();

            let mut node = None;
            let result = match self.before_each().await {
                Ok(Some(ctx)) => {
                    info!("verifying worker node {:?}", ctx.node.name());
                    node = Some(ctx.node.clone());
                    self.run_scenario(*scenario, &ctx).await
                }
                Ok(None) => Ok(Verdict::Skipped(
                    "Discovery mode enabled, performance profile not found".to_string(),
                )),
                Err(e) => Err(e.context("scenario setup failed")),
            };

            if let Err(e) = &result {
                error!("scenario {} failed: {:#}", scenario, e);
            }
            report.scenarios.push(ScenarioOutcome::from_result(
                scenario.name(),
                node.as_ref(),
                started_at,
                started.elapsed(),
                &result,
            ));
        }

        report
    }

    /// Resolve the profile, its pool and the target node; `None` skips the scenario
    pub async fn before_each(&self) -> Result<Option<TargetContext>> {
        let labels = self.config.node_selector_labels();

        let Some(profile) = self.cluster.find_profile(&labels).await? else {
            if self.config.discovery.is_enabled() {
                return Ok(None);
            }
            bail!("no performance profile with node selector {:?}", labels);
        };

        let candidates = self.cluster.candidate_nodes(&labels).await?;
        self.cluster.wait_pools_updated(&profile).await?;

        let node = pick_node(&candidates, self.config.target_node.as_deref())?.clone();
        Ok(Some(TargetContext { profile, node }))
    }

    pub async fn run_scenario(&self, scenario: Scenario, ctx: &TargetContext) -> Result<Verdict> {
        match scenario {
            Scenario::TunedRestartKeepsBannedCpus => self.tuned_restart_keeps_banned_cpus(ctx).await,
            Scenario::BackupHoldsEmptyMask => {
                backup_holds_empty_mask(&self.inspector, &ctx.node).await
            }
            Scenario::CrioRestartRewritesBannedCpus => {
                crio_restart_rewrites_banned_cpus(
                    &self.inspector,
                    &ctx.node,
                    self.config.waits.banned_cpus,
                )
                .await
            }
        }
    }

    pub async fn tuned_restart_keeps_banned_cpus(&self, ctx: &TargetContext) -> Result<Verdict> {
        if ctx.profile.runtime_class().is_none() {
            return Ok(Verdict::Skipped("runtime class not generated".to_string()));
        }
        if ctx.profile.irq_balancing_globally_disabled() {
            return Ok(Verdict::Skipped(
                "this test needs dynamic IRQ balancing".to_string(),
            ));
        }

        let node = &ctx.node;
        let affinity = self
            .inspector
            .default_smp_affinity(node)
            .await
            .with_context(|| format!("failed to extract the default IRQ affinity from node {}", node))?;
        info!("IRQ default affinity on {} when test begins: {{{}}}", node, affinity);

        let banned = self
            .inspector
            .banned_cpus(node)
            .await
            .with_context(|| format!("failed to extract the banned CPUs from node {}", node))?;
        info!("banned CPUs on {} when test begins: {{{}}}", node, banned);

        self.inspector.ensure_pristine(node).await?;

        let namespace = &self.config.test_namespace;
        let pod = pods::test_pod(
            &ctx.profile,
            pods::irq_isolation_annotations(),
            TEST_POD_CPUS,
            node,
            &self.config.test_image,
            namespace,
        );
        let pod_name = self.cluster.create_pod(&pod).await?;

        let result = self.restart_tuned_under_pod(node, &pod_name).await;

        // runs on every path once the pod exists
        info!("deleting pod {:?}", pod_name);
        if let Err(e) = self.cluster.delete_pod(namespace, &pod_name).await {
            warn!("failed to delete test pod {}: {:#}", pod_name, e);
        }
        match self.inspector.banned_cpus(node).await {
            Ok(banned) => info!("banned CPUs on {} when test ends: {{{}}}", node, banned),
            Err(e) => warn!("failed to extract the banned CPUs from node {}: {}", node, e),
        }
        match self.inspector.default_smp_affinity(node).await {
            Ok(affinity) => info!("IRQ default affinity on {} when test ends: {{{}}}", node, affinity),
            Err(e) => warn!("failed to extract the default IRQ affinity from node {}: {}", node, e),
        }

        result
    }

    async fn restart_tuned_under_pod(&self, node: &NodeRef, pod_name: &str) -> Result<Verdict> {
        self.cluster
            .wait_pod_ready(&self.config.test_namespace, pod_name)
            .await?;

        // the pod narrowed the ban list; a TuneD restart must not undo that
        let post_create = self.inspector.banned_cpus(node).await?;
        info!("banned CPUs on {} just before the tuned restart: {{{}}}", node, post_create);
        if post_create.is_empty() {
            return Err(HarnessError::StateMismatch(format!(
                "banned CPUs {{{}}} should not be empty on node {}",
                post_create, node
            ))
            .into());
        }

        info!("causing a restart of the tuned pod (deleting the pod) on {}", node);
        self.cluster.delete_tuned_pod(node).await?;

        info!("waiting for the TuneD daemon running on node {}", node);
        self.config
            .waits
            .tuned_restart
            .until_ok(&format!("TuneD daemon on {}", node), || {
                self.tuned.exec(node, &["test", "-e", TUNED_PID_FILE])
            })
            .await?;

        let post_restart = self.inspector.banned_cpus(node).await?;
        info!("banned CPUs on {} after the tuned restart: {{{}}}", node, post_restart);
        ensure_banned_unchanged(&post_create, &post_restart, node)?;
        Ok(Verdict::Passed)
    }
}

pub fn ensure_banned_unchanged(
    before: &CpuSet,
    after: &CpuSet,
    node: &NodeRef,
) -> Result<(), HarnessError> {
    if before != after {
        return Err(HarnessError::StateMismatch(format!(
            "banned CPUs changed post tuned restart on node {}: {{{}}} became {{{}}}",
            node, before, after
        )));
    }
    Ok(())
}

/// CRI-O saves the ban list once, at first startup, when nothing is pinned yet.
pub async fn backup_holds_empty_mask(inspector: &NodeInspector, node: &NodeRef) -> Result<Verdict> {
    inspector.ensure_pristine(node).await?;
    info!("checking content of {:?} on node {}", ORIG_BANNED_CPUS, node);
    inspector.expect_file_empty(node, ORIG_BANNED_CPUS).await?;
    Ok(Verdict::Passed)
}

/// Fake a ban list, empty the saved copy and restart CRI-O: it must rewrite the ban list.
///
/// Both files are restored afterwards whatever the outcome.
pub async fn crio_restart_rewrites_banned_cpus(
    inspector: &NodeInspector,
    node: &NodeRef,
    poller: Poller,
) -> Result<Verdict> {
    inspector.ensure_pristine(node).await?;

    with_backups(
        inspector.executor(),
        node,
        &[IRQBALANCE_CONF, ORIG_BANNED_CPUS],
        || async {
            info!("preparing fake data for {} on {}", IRQBALANCE_CONF, node);
            inspector
                .write_file(node, IRQBALANCE_CONF, FAKE_BANNED_CPUS)
                .await?;
            inspector.truncate_file(node, ORIG_BANNED_CPUS).await?;

            inspector.restart_service(node, "crio").await?;

            let banned = poller
                .until_ok(&format!("banned CPUs on {} to be rewritten", node), || async {
                    let banned = inspector.banned_cpus(node).await?;
                    if banned.is_empty() {
                        return Err(HarnessError::StateMismatch(
                            "banned CPUs still empty".to_string(),
                        ));
                    }
                    Ok(banned)
                })
                .await?;
            info!("banned CPUs on {} after the CRI-O restart: {{{}}}", node, banned);
            Ok::<_, anyhow::Error>(Verdict::Passed)
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiscoveryMode, ScenarioStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const ROOT: &str = "/rootfs";

    /// in-memory node answering the handful of commands the checks issue
    struct FakeNode {
        files: Mutex<HashMap<String, String>>,
        /// content CRI-O writes to the irqbalance config on restart
        crio_rewrite: Option<&'static str>,
    }

    impl FakeNode {
        fn pristine(orig_banned: &str, crio_rewrite: Option<&'static str>) -> Arc<Self> {
            let files = HashMap::from([
                (path(IRQBALANCE_CONF), "#IRQBALANCE_BANNED_CPUS=\n".to_string()),
                (path(ORIG_BANNED_CPUS), orig_banned.to_string()),
                (path("/proc/irq/default_smp_affinity"), "ff\n".to_string()),
                (path("/sys/devices/system/cpu/online"), "0-7\n".to_string()),
            ]);
            Arc::new(Self {
                files: Mutex::new(files),
                crio_rewrite,
            })
        }

        fn file(&self, p: &str) -> Option<String> {
            self.files.lock().unwrap().get(&path(p)).cloned()
        }

        fn has_file(&self, full_path: &str) -> bool {
            self.files.lock().unwrap().contains_key(full_path)
        }
    }

    fn path(p: &str) -> String {
        format!("{}{}", ROOT, p)
    }

    #[async_trait]
    impl NodeExecutor for FakeNode {
        async fn exec(&self, node: &NodeRef, command: &[&str]) -> Result<String, HarnessError> {
            let fail = |message: &str| HarnessError::CommandFailed {
                node: node.name().to_string(),
                command: command.join(" "),
                message: message.to_string(),
            };
            let mut files = self.files.lock().unwrap();

            match command {
                ["cat", p] => files.get(*p).cloned().ok_or_else(|| fail("no such file")),
                ["wc", "-c", p] => files
                    .get(*p)
                    .map(|c| format!("{} {}\n", c.len(), p))
                    .ok_or_else(|| fail("no such file")),
                ["cp", "-v", from, to] => {
                    let content = files.get(*from).cloned().ok_or_else(|| fail("no such file"))?;
                    files.insert(to.to_string(), content);
                    Ok(format!("'{}' -> '{}'\n", from, to))
                }
                ["mv", "-v", from, to] => {
                    let content = files.remove(*from).ok_or_else(|| fail("no such file"))?;
                    files.insert(to.to_string(), content);
                    Ok(format!("renamed '{}' -> '{}'\n", from, to))
                }
                ["truncate", "-s", "0", p] => {
                    files.insert(p.to_string(), String::new());
                    Ok(String::new())
                }
                ["sh", "-c", script] => {
                    let (printf, target) = script.rsplit_once(" > ").ok_or_else(|| fail("bad script"))?;
                    let quoted = printf
                        .strip_prefix("printf '%s\\n' ")
                        .ok_or_else(|| fail("bad script"))?;
                    let content = quoted.trim_matches('\'');
                    files.insert(target.to_string(), format!("{}\n", content));
                    Ok(String::new())
                }
                ["chroot", _, "systemctl", "restart", "crio"] => {
                    if let Some(rewrite) = self.crio_rewrite {
                        files.insert(path(IRQBALANCE_CONF), rewrite.to_string());
                    }
                    Ok(String::new())
                }
                _ => Err(fail("unexpected command")),
            }
        }

        fn host_root(&self) -> &str {
            ROOT
        }
    }

    /// pod content CRI-O writes when the test pod starts: CPUs 2 and 3 banned
    const POD_BANNED: &str = "IRQBALANCE_BANNED_CPUS=\"0000000c\"\n";

    /// fake API side: every pod and TuneD action lands in `actions`
    struct FakeCluster {
        profile: Option<PerformanceProfile>,
        nodes: Vec<NodeRef>,
        node: Arc<FakeNode>,
        pod_ready: bool,
        /// ban list content once the test pod runs
        pod_banned: Option<&'static str>,
        /// ban list content after the TuneD restart
        tuned_banned: Option<&'static str>,
        actions: Mutex<Vec<String>>,
    }

    impl FakeCluster {
        fn new(profile: Option<PerformanceProfile>, node: Arc<FakeNode>) -> Self {
            Self {
                profile,
                nodes: vec![NodeRef::new("worker-0"), NodeRef::new("worker-1")],
                node,
                pod_ready: true,
                pod_banned: Some(POD_BANNED),
                tuned_banned: None,
                actions: Mutex::new(Vec::new()),
            }
        }

        fn actions(&self) -> Vec<String> {
            self.actions.lock().unwrap().clone()
        }

        fn record(&self, action: String) {
            self.actions.lock().unwrap().push(action);
        }
    }

    #[async_trait]
    impl SuiteCluster for FakeCluster {
        async fn find_profile(
            &self,
            _labels: &BTreeMap<String, String>,
        ) -> Result<Option<PerformanceProfile>> {
            Ok(self.profile.clone())
        }

        async fn wait_pools_updated(&self, _profile: &PerformanceProfile) -> Result<()> {
            Ok(())
        }

        async fn candidate_nodes(
            &self,
            _labels: &BTreeMap<String, String>,
        ) -> Result<Vec<NodeRef>> {
            Ok(self.nodes.clone())
        }

        async fn create_pod(&self, pod: &Pod) -> Result<String> {
            let name = pod.name_any();
            self.record(format!("create {}", name));
            if let Some(banned) = self.pod_banned {
                self.node
                    .files
                    .lock()
                    .unwrap()
                    .insert(path(IRQBALANCE_CONF), banned.to_string());
            }
            Ok(name)
        }

        async fn wait_pod_ready(&self, _namespace: &str, name: &str) -> Result<()> {
            if !self.pod_ready {
                bail!("pod {} never became ready", name);
            }
            Ok(())
        }

        async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
            self.record(format!("delete {}", name));
            Ok(())
        }

        async fn delete_tuned_pod(&self, node: &NodeRef) -> Result<()> {
            self.record(format!("restart tuned on {}", node));
            if let Some(banned) = self.tuned_banned {
                self.node
                    .files
                    .lock()
                    .unwrap()
                    .insert(path(IRQBALANCE_CONF), banned.to_string());
            }
            Ok(())
        }
    }

    /// TuneD pod whose pid file is always present
    struct RunningTuned;

    #[async_trait]
    impl NodeExecutor for RunningTuned {
        async fn exec(&self, _node: &NodeRef, command: &[&str]) -> Result<String, HarnessError> {
            assert_eq!(command, ["test", "-e", TUNED_PID_FILE]);
            Ok(String::new())
        }

        fn host_root(&self) -> &str {
            "/"
        }
    }

    fn profile(runtime_class: Option<&str>, globally_disabled: bool) -> PerformanceProfile {
        let mut value = serde_json::json!({
            "apiVersion": "performance.openshift.io/v2",
            "kind": "PerformanceProfile",
            "metadata": { "name": "manual" },
            "spec": {
                "cpu": { "isolated": "2-7", "reserved": "0-1" },
                "nodeSelector": { "node-role.kubernetes.io/worker-cnf": "" },
                "globallyDisableIrqLoadBalancing": globally_disabled
            }
        });
        if let Some(class) = runtime_class {
            value["status"] = serde_json::json!({ "runtimeClass": class });
        }
        serde_json::from_value(value).unwrap()
    }

    fn suite(cluster: Arc<FakeCluster>, config: HarnessConfig) -> IrqBalanceSuite {
        let inspector = NodeInspector::new(cluster.node.clone());
        IrqBalanceSuite::with_parts(cluster, inspector, Arc::new(RunningTuned), config, None)
    }

    fn target(profile: PerformanceProfile) -> TargetContext {
        TargetContext {
            profile,
            node: NodeRef::new("worker-0"),
        }
    }

    #[tokio::test]
    async fn test_before_each_skips_without_profile_in_discovery_mode() {
        let cluster = Arc::new(FakeCluster::new(None, FakeNode::pristine("", None)));
        let config = HarnessConfig {
            discovery: DiscoveryMode::Enabled,
            ..Default::default()
        };
        let suite = suite(cluster, config);

        assert!(suite.before_each().await.unwrap().is_none());

        let report = suite.run(&[Scenario::BackupHoldsEmptyMask]).await;
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Skipped);
        assert_eq!(
            report.scenarios[0].detail.as_deref(),
            Some("Discovery mode enabled, performance profile not found")
        );
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_before_each_requires_profile_outside_discovery_mode() {
        let cluster = Arc::new(FakeCluster::new(None, FakeNode::pristine("", None)));
        let suite = suite(cluster, HarnessConfig::default());

        let err = suite.before_each().await.err().unwrap();
        assert!(err.to_string().contains("no performance profile"));

        let report = suite.run(&[Scenario::BackupHoldsEmptyMask]).await;
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Failed);
    }

    #[tokio::test]
    async fn test_before_each_honors_target_node() {
        let cluster = Arc::new(FakeCluster::new(
            Some(profile(Some("performance-manual"), false)),
            FakeNode::pristine("", None),
        ));
        let config = HarnessConfig {
            target_node: Some("worker-1".to_string()),
            ..Default::default()
        };

        let ctx = suite(cluster, config).before_each().await.unwrap().unwrap();
        assert_eq!(ctx.node.name(), "worker-1");
    }

    #[tokio::test]
    async fn test_tuned_restart_skips_without_runtime_class() {
        let cluster = Arc::new(FakeCluster::new(None, FakeNode::pristine("", None)));
        let suite = suite(cluster.clone(), HarnessConfig::default());

        let verdict = suite
            .tuned_restart_keeps_banned_cpus(&target(profile(None, false)))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Skipped("runtime class not generated".to_string()));
        assert!(cluster.actions().is_empty());
    }

    #[tokio::test]
    async fn test_tuned_restart_skips_when_irq_balancing_is_disabled() {
        let cluster = Arc::new(FakeCluster::new(None, FakeNode::pristine("", None)));
        let suite = suite(cluster.clone(), HarnessConfig::default());

        let verdict = suite
            .tuned_restart_keeps_banned_cpus(&target(profile(Some("performance-manual"), true)))
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::Skipped("this test needs dynamic IRQ balancing".to_string())
        );
        assert!(cluster.actions().is_empty());
    }

    #[tokio::test]
    async fn test_tuned_restart_keeps_banned_cpus() {
        let cluster = Arc::new(FakeCluster::new(None, FakeNode::pristine("", None)));
        let suite = suite(cluster.clone(), HarnessConfig::default());

        let verdict = suite
            .tuned_restart_keeps_banned_cpus(&target(profile(Some("performance-manual"), false)))
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::Passed);
        let actions = cluster.actions();
        assert_eq!(actions.len(), 3);
        assert!(actions[0].starts_with("create test-"));
        assert_eq!(actions[1], "restart tuned on worker-0");
        assert_eq!(actions[2], actions[0].replace("create", "delete"));
    }

    #[tokio::test]
    async fn test_empty_ban_list_before_tuned_restart_fails_and_deletes_pod() {
        let node = FakeNode::pristine("", None);
        let mut cluster = FakeCluster::new(None, node);
        cluster.pod_banned = None;
        let cluster = Arc::new(cluster);
        let suite = suite(cluster.clone(), HarnessConfig::default());

        let err = suite
            .tuned_restart_keeps_banned_cpus(&target(profile(Some("performance-manual"), false)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("should not be empty"));
        let actions = cluster.actions();
        assert_eq!(actions.len(), 2);
        assert!(actions[1].starts_with("delete test-"));
    }

    #[tokio::test]
    async fn test_changed_ban_list_after_tuned_restart_fails_and_deletes_pod() {
        let mut cluster = FakeCluster::new(None, FakeNode::pristine("", None));
        cluster.tuned_banned = Some("IRQBALANCE_BANNED_CPUS=\"00000004\"\n");
        let cluster = Arc::new(cluster);
        let suite = suite(cluster.clone(), HarnessConfig::default());

        let err = suite
            .tuned_restart_keeps_banned_cpus(&target(profile(Some("performance-manual"), false)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("{2-3} became {2}"));
        assert!(cluster.actions().last().unwrap().starts_with("delete test-"));
    }

    #[tokio::test]
    async fn test_pod_never_ready_still_deletes_pod() {
        let mut cluster = FakeCluster::new(None, FakeNode::pristine("", None));
        cluster.pod_ready = false;
        let cluster = Arc::new(cluster);
        let suite = suite(cluster.clone(), HarnessConfig::default());

        let err = suite
            .tuned_restart_keeps_banned_cpus(&target(profile(Some("performance-manual"), false)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("never became ready"));
        let actions = cluster.actions();
        assert_eq!(actions.len(), 2);
        assert!(actions[1].starts_with("delete test-"));
    }

    fn poller() -> Poller {
        Poller::new(Duration::from_secs(10), Duration::from_secs(300))
    }

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }
        let err = "bogus".parse::<Scenario>().unwrap_err();
        assert!(err.contains("backup-holds-empty-mask"));
    }

    #[test]
    fn test_ensure_banned_unchanged() {
        let node = NodeRef::new("worker-0");
        let before = CpuSet::parse_list("2-3").unwrap();
        assert!(ensure_banned_unchanged(&before, &before.clone(), &node).is_ok());

        let after = CpuSet::parse_list("2").unwrap();
        let err = ensure_banned_unchanged(&before, &after, &node).unwrap_err();
        assert!(err.to_string().contains("{2-3} became {2}"));
    }

    #[tokio::test]
    async fn test_backup_holds_empty_mask() {
        let node = NodeRef::new("worker-0");
        let inspector = NodeInspector::new(FakeNode::pristine("", None));
        assert_eq!(
            backup_holds_empty_mask(&inspector, &node).await.unwrap(),
            Verdict::Passed
        );
    }

    #[tokio::test]
    async fn test_backup_holding_a_mask_fails() {
        let node = NodeRef::new("worker-0");
        let inspector = NodeInspector::new(FakeNode::pristine("0000000c\n", None));
        let err = backup_holds_empty_mask(&inspector, &node).await.unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }

    #[tokio::test]
    async fn test_backup_check_requires_pristine_node() {
        let node = NodeRef::new("worker-0");
        let fake = FakeNode::pristine("", None);
        fake.files
            .lock()
            .unwrap()
            .insert(path("/proc/irq/default_smp_affinity"), "f3\n".to_string());
        let inspector = NodeInspector::new(fake);

        let err = backup_holds_empty_mask(&inspector, &node).await.unwrap_err();
        assert!(err.to_string().contains("IRQBalance already run?"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crio_restart_rewrites_and_files_are_restored() {
        let node = NodeRef::new("worker-0");
        let fake = FakeNode::pristine("", Some("IRQBALANCE_BANNED_CPUS=\"0000000c\"\n"));
        let inspector = NodeInspector::new(fake.clone());

        let verdict = crio_restart_rewrites_banned_cpus(&inspector, &node, poller())
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::Passed);
        assert_eq!(fake.file(IRQBALANCE_CONF).unwrap(), "#IRQBALANCE_BANNED_CPUS=\n");
        assert_eq!(fake.file(ORIG_BANNED_CPUS).unwrap(), "");
        assert!(!fake.has_file("/rootfs/etc/sysconfig/irqbalance.save"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crio_restart_timeout_still_restores() {
        let node = NodeRef::new("worker-0");
        let fake = FakeNode::pristine("", Some("IRQBALANCE_BANNED_CPUS=\n"));
        let inspector = NodeInspector::new(fake.clone());

        let err = crio_restart_rewrites_banned_cpus(&inspector, &node, poller())
            .await
            .unwrap_err();

        assert!(
            err.downcast_ref::<HarnessError>()
                .is_some_and(HarnessError::is_timeout)
        );
        assert_eq!(fake.file(IRQBALANCE_CONF).unwrap(), "#IRQBALANCE_BANNED_CPUS=\n");
        assert!(!fake.has_file("/rootfs/etc/sysconfig/orig_irq_banned_cpus.save"));
    }
}
