//! Scoped backup of node files around destructive test steps
//!
//! A backup copies `<root><path>` to `<root><path>.save`; restoring moves the
//! copy back over the original. [`with_backups`] ties the restore to the
//! scope of a test step so it runs on success, on error and on panic.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::HarnessError;
use crate::executor::NodeExecutor;
use crate::models::NodeRef;

pub const BACKUP_SUFFIX: &str = ".save";

/// A node file copied aside, restored exactly once
pub struct FileBackup {
    executor: Arc<dyn NodeExecutor>,
    node: NodeRef,
    original: String,
    saved: String,
    restored: bool,
}

impl FileBackup {
    /// Copy `path` (a node path, resolved under the executor's host root) aside.
    pub async fn create(
        executor: Arc<dyn NodeExecutor>,
        node: &NodeRef,
        path: &str,
    ) -> Result<Self, HarnessError> {
        let original = executor.host_path(path);
        let saved = format!("{}{}", original, BACKUP_SUFFIX);

        let out = executor
            .exec(node, &["cp", "-v", original.as_str(), saved.as_str()])
            .await
            .map_err(|e| HarnessError::Backup {
                path: original.clone(),
                source: Box::new(e),
            })?;
        debug!("backup on {}: {}", node, out.trim());

        Ok(Self {
            executor,
            node: node.clone(),
            original,
            saved,
            restored: false,
        })
    }

    pub fn original_path(&self) -> &str {
        &self.original
    }

    pub fn saved_path(&self) -> &str {
        &self.saved
    }

    /// Move the saved copy back over the original.
    pub async fn restore(mut self) -> Result<(), HarnessError> {
        self.restored = true;
        let out = self
            .executor
            .exec(&self.node, &["mv", "-v", self.saved.as_str(), self.original.as_str()])
            .await
            .map_err(|e| HarnessError::Restore {
                path: self.original.clone(),
                source: Box::new(e),
            })?;
        debug!("restore on {}: {}", self.node, out.trim());
        Ok(())
    }
}

impl Drop for FileBackup {
    fn drop(&mut self) {
        if self.restored {
            return;
        }

        warn!(
            "backup of {} on {} dropped without restore, restoring in the background",
            self.original, self.node
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(
                "no async runtime to restore {} on {}, saved copy left at {}",
                self.original, self.node, self.saved
            );
            return;
        };

        let executor = self.executor.clone();
        let node = self.node.clone();
        let saved = self.saved.clone();
        let original = self.original.clone();
        handle.spawn(async move {
            if let Err(e) = executor.exec(&node, &["mv", "-v", saved.as_str(), original.as_str()]).await {
                error!("background restore of {} on {} failed: {}", original, node, e);
            }
        });
    }
}

/// Back up `paths`, run `body`, then restore every backup in reverse order.
///
/// If a backup cannot be taken the ones already taken are restored and the
/// body never runs. An error from `body` wins over a restore error, which is
/// then only logged; a panic in `body` is resumed after restoring.
pub async fn with_backups<T, F, Fut>(
    executor: Arc<dyn NodeExecutor>,
    node: &NodeRef,
    paths: &[&str],
    body: F,
) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backups = Vec::with_capacity(paths.len());
    for path in paths {
        match FileBackup::create(executor.clone(), node, path).await {
            Ok(backup) => backups.push(backup),
            Err(e) => {
                if let Err(restore_err) = restore_all(backups).await {
                    error!("{}", restore_err);
                }
                return Err(e.into());
            }
        }
    }

    let outcome = AssertUnwindSafe(body()).catch_unwind().await;
    let restored = restore_all(backups).await;

    match outcome {
        Ok(Ok(value)) => {
            restored?;
            Ok(value)
        }
        Ok(Err(e)) => {
            if let Err(restore_err) = restored {
                error!("{}", restore_err);
            }
            Err(e)
        }
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

// restores all, reporting the first failure
async fn restore_all(backups: Vec<FileBackup>) -> Result<(), HarnessError> {
    let mut first_error = None;
    for backup in backups.into_iter().rev() {
        if let Err(e) = backup.restore().await {
            warn!("{}", e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// records commands and fails the ones containing `fail_on`
    struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingExecutor {
        fn new(fail_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_on,
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeExecutor for RecordingExecutor {
        async fn exec(&self, node: &NodeRef, command: &[&str]) -> Result<String, HarnessError> {
            let rendered = command.join(" ");
            self.commands.lock().unwrap().push(rendered.clone());
            if let Some(pattern) = self.fail_on
                && rendered.contains(pattern)
            {
                return Err(HarnessError::CommandFailed {
                    node: node.name().to_string(),
                    command: rendered,
                    message: "exit status 1".to_string(),
                });
            }
            Ok(String::new())
        }

        fn host_root(&self) -> &str {
            "/rootfs"
        }
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_restore_runs_after_body_error() {
        let executor = RecordingExecutor::new(None);
        let node = NodeRef::new("worker-0");

        let result: anyhow::Result<()> = with_backups(
            executor.clone(),
            &node,
            &["/etc/sysconfig/irqbalance", "/etc/sysconfig/orig_irq_banned_cpus"],
            || async { anyhow::bail!("assertion failed") },
        )
        .await;

        assert_eq!(result.unwrap_err().to_string(), "assertion failed");
        assert_eq!(
            executor.commands(),
            vec![
                "cp -v /rootfs/etc/sysconfig/irqbalance /rootfs/etc/sysconfig/irqbalance.save",
                "cp -v /rootfs/etc/sysconfig/orig_irq_banned_cpus /rootfs/etc/sysconfig/orig_irq_banned_cpus.save",
                "mv -v /rootfs/etc/sysconfig/orig_irq_banned_cpus.save /rootfs/etc/sysconfig/orig_irq_banned_cpus",
                "mv -v /rootfs/etc/sysconfig/irqbalance.save /rootfs/etc/sysconfig/irqbalance",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_backup_skips_body_and_restores_taken_backups() {
        let executor = RecordingExecutor::new(Some("cp -v /rootfs/b"));
        let node = NodeRef::new("worker-0");

        let result = with_backups(executor.clone(), &node, &["/a", "/b"], explode).await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Backup { .. })
        ));
        assert_eq!(
            executor.commands(),
            vec![
                "cp -v /rootfs/a /rootfs/a.save",
                "cp -v /rootfs/b /rootfs/b.save",
                "mv -v /rootfs/a.save /rootfs/a",
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_failure_surfaces_when_body_succeeds() {
        let executor = RecordingExecutor::new(Some("mv"));
        let node = NodeRef::new("worker-0");

        let result = with_backups(executor.clone(), &node, &["/a"], || async { Ok(7) }).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Restore { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_runs_on_panic() {
        let executor = RecordingExecutor::new(None);
        let node = NodeRef::new("worker-0");

        let handle = tokio::spawn({
            let executor = executor.clone();
            async move {
                let _ = with_backups(executor, &node, &["/a"], explode).await;
            }
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(executor.commands().last().unwrap(), "mv -v /rootfs/a.save /rootfs/a");
    }
}
