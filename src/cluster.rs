use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client, Config,
    api::{DeleteParams, ListParams, PostParams},
};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::models::NodeRef;
use crate::poll::Poller;

/// Setup Kubernetes client with proxy support
pub async fn setup_client() -> Result<(Client, Config)> {
    let mut config = Config::infer()
        .await
        .map_err(|e| HarnessError::Precondition(format!("cannot load kubeconfig: {}", e)))?;

    if let Ok(proxy) = std::env::var("HTTPS_PROXY") {
        info!("Using proxy: {}", proxy);
    }

    // corporate proxies commonly re-sign TLS
    if std::env::var("KUBE_INSECURE_TLS").is_ok()
        || std::env::var("KUBERNETES_INSECURE_TLS").is_ok()
    {
        info!("Disabling TLS certificate verification due to environment variable");
        config.accept_invalid_certs = true;
    }

    let client = Client::try_from(config.clone())
        .map_err(|e| HarnessError::Precondition(format!("cannot build cluster client: {}", e)))?;
    Ok((client, config))
}

/// Render labels as a selector; empty values select on key presence with `key=`
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub async fn nodes_by_labels(client: &Client, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let selector = label_selector(labels);
    let node_list = nodes
        .list(&ListParams::default().labels(&selector))
        .await
        .with_context(|| format!("failed to list nodes matching {:?}", selector))?;
    info!("Found {} nodes matching {}", node_list.items.len(), selector);
    Ok(node_list.items)
}

pub fn node_refs(nodes: &[Node]) -> Vec<NodeRef> {
    nodes.iter().map(NodeRef::from).collect()
}

/// Parse a CPU quantity (`16`, `15500m`) into millicores
pub fn parse_cpu_millis(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse().ok();
    }
    quantity
        .parse::<f64>()
        .ok()
        .filter(|cpus| *cpus >= 0.0)
        .map(|cpus| (cpus * 1000.0).round() as u64)
}

/// Nodes whose allocatable CPU can host at least `cpus` whole CPUs
pub fn nodes_with_allocatable_cpus(nodes: &[Node], cpus: usize) -> Vec<&Node> {
    let required = cpus as u64 * 1000;
    nodes
        .iter()
        .filter(|node| {
            node.status
                .as_ref()
                .and_then(|s| s.allocatable.as_ref())
                .and_then(|a| a.get("cpu"))
                .and_then(|q| parse_cpu_millis(&q.0))
                .is_some_and(|millis| millis >= required)
        })
        .collect()
}

/// Create `name`; an existing namespace is reported but tolerated
pub async fn create_namespace(client: &Client, name: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    if namespaces.get_opt(name).await?.is_some() {
        warn!("{:?} namespace already exists, that is unexpected", name);
        return Ok(());
    }

    namespaces
        .create(&PostParams::default(), &ns)
        .await
        .with_context(|| format!("cannot create namespace {:?}", name))?;
    info!("created namespace {:?}", name);
    Ok(())
}

pub async fn delete_namespace(client: &Client, name: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    namespaces
        .delete(name, &DeleteParams::default())
        .await
        .with_context(|| format!("namespace {:?} could not be deleted", name))?;
    Ok(())
}

pub async fn wait_for_namespace_deletion(client: &Client, name: &str, poller: Poller) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    poller
        .until_ok(&format!("namespace {} deletion", name), || async {
            match namespaces.get_opt(name).await? {
                None => Ok(()),
                Some(_) => Err(anyhow::anyhow!("namespace {} still present", name)),
            }
        })
        .await?;
    Ok(())
}
