//! Lifecycle of the latency test run
//!
//! Setup repartitions the profile's CPUs for the latency tests and prepulls
//! the test image; teardown puts the profile back as it was. The two may run
//! in separate invocations, linked by a [`LatencyState`] file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::cluster;
use crate::cpuset::CpuSet;
use crate::error::HarnessError;
use crate::mcp;
use crate::models::{HarnessConfig, ScenarioOutcome, SuiteReport, Verdict};
use crate::pods::{self, PREPULL_DAEMONSET};
use crate::profile::{self, PerformanceProfile, PerformanceProfileSpec};

pub const SUITE_NAME: &str = "latency";
/// isolated and reserved sets do not overlap; isolated holds an even CPU count
pub const LATENCY_ISOLATED: &str = "1-9";
pub const LATENCY_RESERVED: &str = "0";

/// What teardown needs to undo setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyState {
    pub profile_name: String,
    pub initial_spec: PerformanceProfileSpec,
    pub prepull_namespace: String,
    pub created_at: DateTime<Utc>,
}

impl LatencyState {
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json_data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json_data)
            .with_context(|| format!("failed to write latency state to {}", path.display()))?;
        info!("latency state saved to: {}", path.display());
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json_data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read latency state from {}", path.display()))?;
        serde_json::from_str(&json_data)
            .with_context(|| format!("invalid latency state in {}", path.display()))
    }
}

pub fn ensure_test_executable(path: &Path) -> Result<(), HarnessError> {
    if !path.exists() {
        return Err(HarnessError::Precondition(format!(
            "latency test executable not found at {}",
            path.display()
        )));
    }
    Ok(())
}

/// Decide whether the profile should be repartitioned to `isolated` / `reserved`.
///
/// Only when some worker can actually host both sets, and the profile does not
/// already match them.
pub fn needs_cpu_update(
    profile: &PerformanceProfile,
    workers: &[Node],
    isolated: &CpuSet,
    reserved: &CpuSet,
) -> Result<bool> {
    let total = isolated.len() + reserved.len();
    let sufficient = cluster::nodes_with_allocatable_cpus(workers, total);
    if sufficient.is_empty() {
        info!("no worker node can allocate {} CPUs, keeping the profile CPU sets", total);
        return Ok(false);
    }
    Ok(!profile.has_cpu_partition(isolated, reserved)?)
}

/// Prepare the cluster for the latency tests; returns what teardown must undo.
pub async fn setup(client: &Client, config: &HarnessConfig) -> Result<LatencyState> {
    let labels = config.node_selector_labels();
    let profile = profile::get_by_node_labels(client, &labels).await?;
    let workers = cluster::nodes_by_labels(client, &labels).await?;

    let state = LatencyState {
        profile_name: profile.name_any(),
        initial_spec: profile.spec.clone(),
        prepull_namespace: config.prepull_namespace.clone(),
        created_at: Utc::now(),
    };

    let isolated = CpuSet::parse_list(LATENCY_ISOLATED)?;
    let reserved = CpuSet::parse_list(LATENCY_RESERVED)?;
    if needs_cpu_update(&profile, &workers, &isolated, &reserved)? {
        info!("update the isolated and reserved cpus sets of the profile");
        if let Err(e) = repartition(client, config, &profile, &isolated, &reserved).await {
            error!("could not update the profile with the desired CPUs sets: {:#}", e);
        }
    }

    if let Err(e) = cluster::create_namespace(client, &config.prepull_namespace).await {
        error!("cannot create the namespace: {:#}", e);
    }

    let (ds, prepulled) = pods::prepull_image(
        client,
        PREPULL_DAEMONSET,
        &config.prepull_namespace,
        &config.test_image,
        config.waits.daemonset_ready,
    )
    .await;
    if let Err(e) = prepulled {
        let status = ds
            .as_ref()
            .and_then(|ds| serde_json::to_string(ds).ok())
            .unwrap_or_default();
        info!(
            "DaemonSet {}/{} image={:?} status:\n{}",
            config.prepull_namespace, PREPULL_DAEMONSET, config.test_image, status
        );
        error!("cannot prepull image {:?}: {:#}", config.test_image, e);
    }

    Ok(state)
}

async fn repartition(
    client: &Client,
    config: &HarnessConfig,
    profile: &PerformanceProfile,
    isolated: &CpuSet,
    reserved: &CpuSet,
) -> Result<()> {
    let pool = mcp::pool_for_profile(client, profile).await?;
    profile::update_isolated_reserved(client, profile, isolated, reserved).await?;
    mcp::wait_for_rollout(client, &pool, config.waits.machine_config_pool).await
}

/// Undo [`setup`]. Cleanup failures are logged; only an unreadable profile is an error.
pub async fn teardown(client: &Client, config: &HarnessConfig, state: &LatencyState) -> Result<()> {
    let namespace = &state.prepull_namespace;
    match cluster::delete_namespace(client, namespace).await {
        Ok(()) => {
            if let Err(e) =
                cluster::wait_for_namespace_deletion(client, namespace, config.waits.namespace_deletion)
                    .await
            {
                warn!("{:#}", e);
            }
        }
        Err(e) => error!("namespace {:?} could not be deleted: {:#}", namespace, e),
    }

    let labels = config.node_selector_labels();
    let current = profile::get_by_node_labels(client, &labels).await?;
    if current.spec != state.initial_spec {
        info!("restore initial performance profile {}", state.profile_name);
        if let Err(e) = restore_profile(client, config, &current, &state.initial_spec).await {
            error!("could not restore the initial profile: {:#}", e);
        }
    }
    Ok(())
}

async fn restore_profile(
    client: &Client,
    config: &HarnessConfig,
    current: &PerformanceProfile,
    spec: &PerformanceProfileSpec,
) -> Result<()> {
    let pool = mcp::pool_for_profile(client, current).await?;
    profile::apply_spec(client, current, spec).await?;
    mcp::wait_for_rollout(client, &pool, config.waits.machine_config_pool).await
}

/// Run the latency test executable with inherited stdio.
pub async fn run_executable(config: &HarnessConfig, args: &[String]) -> Result<std::process::ExitStatus> {
    info!(
        "running {} {}",
        config.test_executable.display(),
        args.join(" ")
    );
    Command::new(&config.test_executable)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to start {}", config.test_executable.display()))
}

/// Setup, run the tests, then tear down on every path.
pub async fn run(
    client: &Client,
    config: &HarnessConfig,
    api_server_url: Option<String>,
    args: &[String],
) -> Result<SuiteReport> {
    ensure_test_executable(&config.test_executable)?;
    let state = setup(client, config).await?;

    let started_at = Utc::now();
    let started = Instant::now();
    let result = match run_executable(config, args).await {
        Ok(status) if status.success() => Ok(Verdict::Passed),
        Ok(status) => Err(anyhow::anyhow!("latency tests exited with {}", status)),
        Err(e) => Err(e),
    };

    if config.cleanup_mode.should_cleanup() {
        if let Err(e) = teardown(client, config, &state).await {
            error!("latency teardown failed: {:#}", e);
        }
    } else {
        warn!(
            "skipping teardown, profile {} and namespace {} left as set up",
            state.profile_name, state.prepull_namespace
        );
    }

    let mut report = SuiteReport::new(SUITE_NAME, api_server_url);
    report.scenarios.push(ScenarioOutcome::from_result(
        "latency-tests",
        None,
        started_at,
        started.elapsed(),
        &result,
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn profile(isolated: &str, reserved: &str) -> PerformanceProfile {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "performance.openshift.io/v2",
            "kind": "PerformanceProfile",
            "metadata": { "name": "manual" },
            "spec": {
                "cpu": { "isolated": isolated, "reserved": reserved },
                "nodeSelector": { "node-role.kubernetes.io/worker-cnf": "" }
            }
        }))
        .unwrap()
    }

    fn worker(cpu: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                allocatable: Some(BTreeMap::from([("cpu".to_string(), Quantity(cpu.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn latency_sets() -> (CpuSet, CpuSet) {
        (
            CpuSet::parse_list(LATENCY_ISOLATED).unwrap(),
            CpuSet::parse_list(LATENCY_RESERVED).unwrap(),
        )
    }

    #[test]
    fn test_needs_cpu_update_when_a_worker_fits() {
        let (isolated, reserved) = latency_sets();
        let workers = vec![worker("4"), worker("16")];
        assert!(needs_cpu_update(&profile("2-7", "0-1"), &workers, &isolated, &reserved).unwrap());
    }

    #[test]
    fn test_no_update_without_capacity() {
        let (isolated, reserved) = latency_sets();
        let workers = vec![worker("8"), worker("9500m")];
        assert!(!needs_cpu_update(&profile("2-7", "0-1"), &workers, &isolated, &reserved).unwrap());
    }

    #[test]
    fn test_no_update_when_already_partitioned() {
        let (isolated, reserved) = latency_sets();
        let workers = vec![worker("16")];
        assert!(!needs_cpu_update(&profile("1-9", "0"), &workers, &isolated, &reserved).unwrap());
    }

    #[test]
    fn test_missing_executable_is_a_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_test_executable(&dir.path().join("latency-e2e.test")).unwrap_err();
        assert!(matches!(err, HarnessError::Precondition(_)));

        let exe = dir.path().join("present.test");
        std::fs::write(&exe, "").unwrap();
        assert!(ensure_test_executable(&exe).is_ok());
    }

    #[test]
    fn test_state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency-state.json");
        let state = LatencyState {
            profile_name: "manual".to_string(),
            initial_spec: profile("2-7", "0-1").spec,
            prepull_namespace: "testing-prepull".to_string(),
            created_at: Utc::now(),
        };

        state.save_to(&path).unwrap();
        let loaded = LatencyState::load_from(&path).unwrap();
        assert_eq!(loaded.initial_spec, state.initial_spec);
        assert_eq!(loaded.profile_name, "manual");
    }

    #[tokio::test]
    async fn test_run_executable_reports_exit_status() {
        let config = HarnessConfig {
            test_executable: "false".into(),
            ..Default::default()
        };
        let status = run_executable(&config, &[]).await.unwrap();
        assert!(!status.success());
    }
}
