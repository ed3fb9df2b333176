//! Reading and perturbing IRQ-related node state through a [`NodeExecutor`]

use std::sync::Arc;
use tracing::{info, warn};

use crate::cpuset::CpuSet;
use crate::error::HarnessError;
use crate::executor::NodeExecutor;
use crate::models::{NodeRef, NodeStateReport};
use crate::sysconfig::{self, BANNED_CPUS_KEY};

pub const IRQBALANCE_CONF: &str = "/etc/sysconfig/irqbalance";
pub const ORIG_BANNED_CPUS: &str = "/etc/sysconfig/orig_irq_banned_cpus";
pub const DEFAULT_SMP_AFFINITY: &str = "/proc/irq/default_smp_affinity";
pub const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

pub struct NodeInspector {
    executor: Arc<dyn NodeExecutor>,
}

impl NodeInspector {
    pub fn new(executor: Arc<dyn NodeExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> Arc<dyn NodeExecutor> {
        self.executor.clone()
    }

    pub async fn read_file(&self, node: &NodeRef, path: &str) -> Result<String, HarnessError> {
        let full_path = self.executor.host_path(path);
        self.executor.exec(node, &["cat", full_path.as_str()]).await
    }

    /// CPUs irqbalance is told to keep interrupts away from
    pub async fn banned_cpus(&self, node: &NodeRef) -> Result<CpuSet, HarnessError> {
        let conf = self.read_file(node, IRQBALANCE_CONF).await?;

        let line = sysconfig::find_setting(&conf, BANNED_CPUS_KEY);
        if line.is_empty() {
            warn!(
                "cannot find the CPU ban list in the configuration of {} (\n{})",
                node, conf
            );
        } else {
            info!("banned CPUs setting on {}: {:?}", node, line);
        }

        sysconfig::parse_banned_cpus(&conf)
    }

    pub async fn default_smp_affinity(&self, node: &NodeRef) -> Result<String, HarnessError> {
        Ok(self
            .read_file(node, DEFAULT_SMP_AFFINITY)
            .await?
            .trim()
            .to_string())
    }

    pub async fn default_smp_affinity_set(&self, node: &NodeRef) -> Result<CpuSet, HarnessError> {
        CpuSet::parse_mask(&self.default_smp_affinity(node).await?)
    }

    pub async fn online_cpus(&self, node: &NodeRef) -> Result<CpuSet, HarnessError> {
        CpuSet::parse_list(&self.read_file(node, ONLINE_CPUS).await?)
    }

    /// Require that no IRQ balancing has narrowed the default affinity yet.
    pub async fn ensure_pristine(&self, node: &NodeRef) -> Result<(), HarnessError> {
        let affinity = self.default_smp_affinity_set(node).await?;
        let online = self.online_cpus(node).await?;
        if affinity != online {
            return Err(HarnessError::StateMismatch(format!(
                "found default_smp_affinity {} on {}, expected {} - IRQBalance already run?",
                affinity, node, online
            )));
        }
        Ok(())
    }

    /// Require `path` to be zero bytes long, as reported by `wc -c`.
    pub async fn expect_file_empty(&self, node: &NodeRef, path: &str) -> Result<(), HarnessError> {
        let full_path = self.executor.host_path(path);
        let out = self
            .executor
            .exec(node, &["wc", "-c", full_path.as_str()])
            .await?;
        check_wc_empty(&out, &full_path)
    }

    /// Collect everything the IRQ checks look at into one report
    pub async fn snapshot(&self, node: &NodeRef) -> Result<NodeStateReport, HarnessError> {
        let default_smp_affinity = self.default_smp_affinity(node).await?;
        let default_smp_affinity_cpus = CpuSet::parse_mask(&default_smp_affinity)?;
        let online_cpus = self.online_cpus(node).await?;

        let orig_banned_cpus_empty = match self.expect_file_empty(node, ORIG_BANNED_CPUS).await {
            Ok(()) => Some(true),
            Err(HarnessError::StateMismatch(_)) => Some(false),
            Err(e) => {
                warn!("cannot check {} on {}: {}", ORIG_BANNED_CPUS, node, e);
                None
            }
        };

        Ok(NodeStateReport {
            node: node.name().to_string(),
            banned_cpus: self.banned_cpus(node).await?,
            pristine: default_smp_affinity_cpus == online_cpus,
            default_smp_affinity,
            default_smp_affinity_cpus,
            online_cpus,
            orig_banned_cpus_empty,
        })
    }

    pub async fn write_file(
        &self,
        node: &NodeRef,
        path: &str,
        content: &str,
    ) -> Result<(), HarnessError> {
        let full_path = self.executor.host_path(path);
        let script = format!("printf '%s\\n' {} > {}", shell_quote(content), full_path);
        self.executor
            .exec(node, &["sh", "-c", script.as_str()])
            .await?;
        Ok(())
    }

    pub async fn truncate_file(&self, node: &NodeRef, path: &str) -> Result<(), HarnessError> {
        let full_path = self.executor.host_path(path);
        self.executor
            .exec(node, &["truncate", "-s", "0", full_path.as_str()])
            .await?;
        Ok(())
    }

    pub async fn restart_service(&self, node: &NodeRef, unit: &str) -> Result<(), HarnessError> {
        info!("restarting {} on {}", unit, node);
        let root = self.executor.host_root().to_string();
        self.executor
            .exec(node, &["chroot", root.as_str(), "systemctl", "restart", unit])
            .await?;
        Ok(())
    }
}

/// `wc -c` prints `<bytes> <path>`; only `0 <path>` counts as empty
pub fn check_wc_empty(output: &str, full_path: &str) -> Result<(), HarnessError> {
    let expected = format!("0 {}", full_path);
    let actual = output.trim_end();
    if actual != expected {
        return Err(HarnessError::StateMismatch(format!(
            "file {} not empty: wc reported {:?}",
            full_path, actual
        )));
    }
    Ok(())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
