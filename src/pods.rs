//! Test pods, pod lifecycle waits and the image prepull DaemonSet

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, Event, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::models::NodeRef;
use crate::poll::Poller;
use crate::profile::PerformanceProfile;

pub const TEST_POD_LABEL: &str = "tunecheck-test";
const TEST_POD_MEMORY: &str = "256Mi";

/// Annotations asking CRI-O to keep interrupts and CFS quota off the pod's CPUs
pub fn irq_isolation_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("irq-load-balancing.crio.io".to_string(), "disable".to_string()),
        ("cpu-quota.crio.io".to_string(), "disable".to_string()),
    ])
}

/// Build a guaranteed-QoS pod pinned to `node` running under the profile's runtime class
pub fn test_pod(
    profile: &PerformanceProfile,
    annotations: BTreeMap<String, String>,
    cpus: u32,
    node: &NodeRef,
    image: &str,
    namespace: &str,
) -> Pod {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpus.to_string())),
        ("memory".to_string(), Quantity(TEST_POD_MEMORY.to_string())),
    ]);

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("test-{}", &suffix[..8])),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                TEST_POD_LABEL.to_string(),
            )])),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.name().to_string()),
            runtime_class_name: Some(profile.runtime_class_name()),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            containers: vec![Container {
                name: "test".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "10h".to_string()]),
                resources: Some(ResourceRequirements {
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub async fn create_pod(client: &Client, pod: &Pod) -> Result<Pod> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    debug!("creating pod:\n{}", serde_json::to_string(pod)?);
    let created = pods
        .create(&PostParams::default(), pod)
        .await
        .with_context(|| format!("failed to create pod {}/{}", namespace, pod.name_any()))?;
    info!("created pod {}/{}", namespace, created.name_any());
    Ok(created)
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub async fn wait_for_pod_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: Poller,
) -> Result<Pod> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = poller
        .until_ok(&format!("pod {}/{} to be ready", namespace, name), || async {
            let pod = pods.get(name).await?;
            if is_pod_ready(&pod) {
                return Ok(pod);
            }
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            Err(anyhow::anyhow!("pod is {} and not ready", phase))
        })
        .await?;
    Ok(pod)
}

/// Log the events recorded for a pod, useful when it failed to start
pub async fn log_pod_events(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().fields(&format!("involvedObject.name={}", name));
    let event_list = events
        .list(&lp)
        .await
        .with_context(|| format!("failed to list events of pod {}/{}", namespace, name))?;

    info!("{} events for pod {}/{}", event_list.items.len(), namespace, name);
    for event in event_list.items {
        info!(
            "  {} {}: {}",
            event.type_.as_deref().unwrap_or("-"),
            event.reason.as_deref().unwrap_or("-"),
            event.message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Delete a pod and wait until the object with the same uid is gone
pub async fn delete_pod_and_wait(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: Poller,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let uid = pods
        .get_opt(name)
        .await?
        .and_then(|p| p.metadata.uid);

    pods.delete(name, &DeleteParams::default())
        .await
        .with_context(|| format!("failed to delete pod {}/{}", namespace, name))?;
    info!("deleted pod {}/{}", namespace, name);

    poller
        .until_ok(&format!("pod {}/{} deletion", namespace, name), || async {
            match pods.get_opt(name).await? {
                Some(pod) if pod.metadata.uid == uid => {
                    Err(anyhow::anyhow!("pod {} still present", name))
                }
                _ => Ok(()),
            }
        })
        .await?;
    Ok(())
}

/// Name of the DaemonSet that pulls the test image onto every node
pub const PREPULL_DAEMONSET: &str = "cnf-tests";

pub fn prepull_daemonset(name: &str, namespace: &str, image: &str) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_string(), format!("prepull-{}", name))]);

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(0),
                    containers: vec![Container {
                        name: "prepull".to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec!["sleep".to_string(), "inf".to_string()]),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ready once every scheduled pod, on at least one node, is ready
pub fn is_daemonset_ready(ds: &DaemonSet) -> bool {
    ds.status.as_ref().is_some_and(|s| {
        s.desired_number_scheduled > 0 && s.number_ready == s.desired_number_scheduled
    })
}

/// Create the prepull DaemonSet and wait until the image runs on every node.
///
/// The DaemonSet is handed back on failure too, so callers can log its status.
pub async fn prepull_image(
    client: &Client,
    name: &str,
    namespace: &str,
    image: &str,
    poller: Poller,
) -> (Option<DaemonSet>, Result<()>) {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let ds = prepull_daemonset(name, namespace, image);

    if let Err(e) = api.create(&PostParams::default(), &ds).await {
        return (
            Some(ds),
            Err(anyhow::Error::new(e).context("failed to create the prepull DaemonSet")),
        );
    }
    info!("prepulling {} through DaemonSet {}/{}", image, namespace, name);

    let waited = poller
        .until_ok(&format!("DaemonSet {}/{} to be ready", namespace, name), || async {
            let ds = api.get(name).await?;
            if is_daemonset_ready(&ds) {
                Ok(ds)
            } else {
                Err(anyhow::anyhow!(
                    "{}/{} pods ready",
                    ds.status.as_ref().map_or(0, |s| s.number_ready),
                    ds.status.as_ref().map_or(0, |s| s.desired_number_scheduled)
                ))
            }
        })
        .await;

    match waited {
        Ok(ready) => (Some(ready), Ok(())),
        Err(e) => {
            let latest = match api.get_opt(name).await {
                Ok(latest) => latest,
                Err(get_err) => {
                    warn!("cannot refresh DaemonSet {}/{}: {}", namespace, name, get_err);
                    None
                }
            };
            (latest.or(Some(ds)), Err(e.into()))
        }
    }
}
