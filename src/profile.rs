//! PerformanceProfile custom resource and the lookups the suites need

use anyhow::{Context, Result, bail};
use kube::{
    Api, Client, CustomResource, ResourceExt,
    api::{ListParams, Patch, PatchParams, PostParams},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

use crate::cpuset::CpuSet;

/// prefix of the runtime class the operator generates for a profile
const RUNTIME_CLASS_PREFIX: &str = "performance";
const NODE_ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";
const MACHINE_CONFIG_ROLE_LABEL: &str = "machineconfiguration.openshift.io/role";

/// Tuning the operator applies to the nodes matching `node_selector`.
///
/// Only the fields the suites read or write are typed; everything else
/// survives a read-modify-write round trip through `extra`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "performance.openshift.io",
    version = "v2",
    kind = "PerformanceProfile",
    plural = "performanceprofiles",
    status = "PerformanceProfileStatus",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceProfileSpec {
    #[serde(default)]
    pub cpu: CpuSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_config_label: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub globally_disable_irq_load_balancing: Option<bool>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// CPU partitioning of the tuned nodes, in list format
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_isolated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offlined: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceProfileStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuned: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ProfileCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PerformanceProfile {
    /// runtime class reported by the operator, if it generated one
    pub fn runtime_class(&self) -> Option<&str> {
        self.status.as_ref()?.runtime_class.as_deref()
    }

    /// runtime class test pods should use: the reported one, else the generated name
    pub fn runtime_class_name(&self) -> String {
        self.runtime_class()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", RUNTIME_CLASS_PREFIX, self.name_any()))
    }

    pub fn irq_balancing_globally_disabled(&self) -> bool {
        self.spec.globally_disable_irq_load_balancing.unwrap_or(false)
    }

    pub fn isolated_cpus(&self) -> Result<CpuSet> {
        parse_cpu_field("isolated", self.spec.cpu.isolated.as_deref())
    }

    pub fn reserved_cpus(&self) -> Result<CpuSet> {
        parse_cpu_field("reserved", self.spec.cpu.reserved.as_deref())
    }

    /// whether the profile already partitions CPUs as `isolated` / `reserved`
    pub fn has_cpu_partition(&self, isolated: &CpuSet, reserved: &CpuSet) -> Result<bool> {
        Ok(&self.isolated_cpus()? == isolated && &self.reserved_cpus()? == reserved)
    }

    /// Labels the machine configs rendered for this profile carry.
    ///
    /// An explicit `machineConfigLabel` wins; otherwise the role is taken from
    /// the `node-role.kubernetes.io/<role>` node selector key.
    pub fn machine_config_label(&self) -> Option<BTreeMap<String, String>> {
        if let Some(labels) = &self.spec.machine_config_label {
            return Some(labels.clone());
        }

        let role = self
            .spec
            .node_selector
            .as_ref()?
            .keys()
            .find_map(|key| key.strip_prefix(NODE_ROLE_LABEL_PREFIX))?;
        Some(BTreeMap::from([(
            MACHINE_CONFIG_ROLE_LABEL.to_string(),
            role.to_string(),
        )]))
    }
}

fn parse_cpu_field(field: &str, value: Option<&str>) -> Result<CpuSet> {
    CpuSet::parse_list(value.unwrap_or_default())
        .with_context(|| format!("profile has an invalid {} CPU set", field))
}

/// Profiles whose node selector is exactly `labels`
pub fn matching_profiles<'a>(
    profiles: &'a [PerformanceProfile],
    labels: &BTreeMap<String, String>,
) -> Vec<&'a PerformanceProfile> {
    profiles
        .iter()
        .filter(|p| p.spec.node_selector.as_ref() == Some(labels))
        .collect()
}

/// Find the single profile tuning the nodes selected by `labels`
pub async fn find_by_node_labels(
    client: &Client,
    labels: &BTreeMap<String, String>,
) -> Result<Option<PerformanceProfile>> {
    let api: Api<PerformanceProfile> = Api::all(client.clone());
    let profiles = api
        .list(&ListParams::default())
        .await
        .context("failed to list performance profiles")?
        .items;

    match matching_profiles(&profiles, labels).as_slice() {
        [] => Ok(None),
        [profile] => Ok(Some((*profile).clone())),
        many => bail!(
            "found {} performance profiles with node selector {:?}, expected one",
            many.len(),
            labels
        ),
    }
}

pub async fn get_by_node_labels(
    client: &Client,
    labels: &BTreeMap<String, String>,
) -> Result<PerformanceProfile> {
    find_by_node_labels(client, labels)
        .await?
        .with_context(|| format!("no performance profile with node selector {:?}", labels))
}

/// Merge-patch the isolated and reserved CPU sets of `profile`
pub async fn update_isolated_reserved(
    client: &Client,
    profile: &PerformanceProfile,
    isolated: &CpuSet,
    reserved: &CpuSet,
) -> Result<PerformanceProfile> {
    let name = profile.name_any();
    info!(
        "updating profile {}: isolated {} reserved {}",
        name, isolated, reserved
    );

    let patch = json!({
        "spec": {
            "cpu": {
                "isolated": isolated.to_string(),
                "reserved": reserved.to_string(),
            }
        }
    });
    let api: Api<PerformanceProfile> = Api::all(client.clone());
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("failed to update the CPU sets of profile {}", name))
}

/// Replace the spec of `current` with `spec`, keeping its identity
pub async fn apply_spec(
    client: &Client,
    current: &PerformanceProfile,
    spec: &PerformanceProfileSpec,
) -> Result<PerformanceProfile> {
    let name = current.name_any();
    let mut updated = current.clone();
    updated.spec = spec.clone();

    let api: Api<PerformanceProfile> = Api::all(client.clone());
    api.replace(&name, &PostParams::default(), &updated)
        .await
        .with_context(|| format!("failed to restore profile {}", name))
}
