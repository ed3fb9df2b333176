//! Machine config pools, read untyped through the dynamic API

use anyhow::{Context, Result, bail};
use kube::{
    Api, Client, ResourceExt,
    api::{DynamicObject, GroupVersionKind, ListParams},
    discovery::ApiResource,
};
use std::collections::BTreeMap;
use tracing::info;

use crate::poll::Poller;
use crate::profile::PerformanceProfile;

pub const CONDITION_UPDATED: &str = "Updated";
pub const CONDITION_UPDATING: &str = "Updating";

fn pool_resource() -> ApiResource {
    let gvk = GroupVersionKind {
        group: "machineconfiguration.openshift.io".to_string(),
        version: "v1".to_string(),
        kind: "MachineConfigPool".to_string(),
    };
    ApiResource::from_gvk(&gvk)
}

fn pools_api(client: &Client) -> Api<DynamicObject> {
    Api::all_with(client.clone(), &pool_resource())
}

/// Status (`True`, `False`, `Unknown`) of the condition `type_` of `pool`
pub fn pool_condition(pool: &DynamicObject, type_: &str) -> Option<String> {
    pool.data
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        .map(str::to_string)
}

/// Whether the pool itself is labelled with every one of `labels`
pub fn carries_labels(pool: &DynamicObject, labels: &BTreeMap<String, String>) -> bool {
    let own = pool.labels();
    labels.iter().all(|(k, v)| own.get(k) == Some(v))
}

/// Whether the pool's machine config selector matches every one of `labels`
///
/// Both `matchLabels` and `In` / `Exists` entries of `matchExpressions` are honored.
pub fn selects_machine_configs(pool: &DynamicObject, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = pool.data.pointer("/spec/machineConfigSelector") else {
        return false;
    };
    let match_labels = selector.get("matchLabels").and_then(|m| m.as_object());
    let expressions = selector
        .get("matchExpressions")
        .and_then(|e| e.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    if match_labels.is_none() && expressions.is_empty() {
        return false;
    }

    let labels_ok = match_labels.is_none_or(|m| {
        m.iter()
            .all(|(k, v)| labels.get(k).map(String::as_str) == v.as_str())
    });
    let expressions_ok = expressions.iter().all(|expr| {
        let key = expr.get("key").and_then(|k| k.as_str()).unwrap_or_default();
        let value = labels.get(key);
        match expr.get("operator").and_then(|o| o.as_str()) {
            Some("In") => value.is_some_and(|v| {
                expr.get("values")
                    .and_then(|vs| vs.as_array())
                    .is_some_and(|vs| vs.iter().any(|x| x.as_str() == Some(v.as_str())))
            }),
            Some("Exists") => value.is_some(),
            Some("DoesNotExist") => value.is_none(),
            Some("NotIn") => value.is_none_or(|v| {
                expr.get("values")
                    .and_then(|vs| vs.as_array())
                    .is_none_or(|vs| vs.iter().all(|x| x.as_str() != Some(v.as_str())))
            }),
            _ => false,
        }
    });
    labels_ok && expressions_ok
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pick the pool of `labels` out of `pools`: first one labelled with them,
/// else the first whose machine config selector matches them
pub fn pick_pool<'a>(
    pools: &'a [DynamicObject],
    labels: &BTreeMap<String, String>,
) -> Option<&'a DynamicObject> {
    pools
        .iter()
        .find(|pool| carries_labels(pool, labels))
        .or_else(|| pools.iter().find(|pool| selects_machine_configs(pool, labels)))
}

/// Name of the pool rendering the machine configs of `profile`
pub async fn pool_for_profile(client: &Client, profile: &PerformanceProfile) -> Result<String> {
    let labels = profile.machine_config_label().with_context(|| {
        format!(
            "cannot derive the machine config label of profile {}",
            profile.name_any()
        )
    })?;
    let api = pools_api(client);

    let labelled = api
        .list(&ListParams::default().labels(&label_selector(&labels)))
        .await
        .context("failed to list machine config pools")?;
    if let Some(pool) = pick_pool(&labelled.items, &labels) {
        return Ok(pool.name_any());
    }

    let pools = api
        .list(&ListParams::default())
        .await
        .context("failed to list machine config pools")?;
    match pick_pool(&pools.items, &labels) {
        Some(pool) => Ok(pool.name_any()),
        None => bail!("no machine config pool found for machine config labels {:?}", labels),
    }
}

/// Poll until condition `type_` of pool `name` has `status`
pub async fn wait_for_condition(
    client: &Client,
    name: &str,
    type_: &str,
    status: &str,
    poller: Poller,
) -> Result<()> {
    info!("waiting for machine config pool {} to be {}={}", name, type_, status);
    let api = pools_api(client);
    poller
        .until_ok(
            &format!("machine config pool {} {}={}", name, type_, status),
            || async {
                let pool = api.get(name).await?;
                match pool_condition(&pool, type_) {
                    Some(current) if current == status => Ok(()),
                    current => Err(anyhow::anyhow!(
                        "condition {} is {}",
                        type_,
                        current.as_deref().unwrap_or("missing")
                    )),
                }
            },
        )
        .await?;
    Ok(())
}

/// A CPU partition change rolls the pool: wait for it to start and settle
pub async fn wait_for_rollout(client: &Client, name: &str, poller: Poller) -> Result<()> {
    wait_for_condition(client, name, CONDITION_UPDATING, "True", poller).await?;
    wait_for_condition(client, name, CONDITION_UPDATED, "True", poller).await
}
