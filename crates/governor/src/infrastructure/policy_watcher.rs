use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use api_types::PolicyDocument;
use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::policy::load_policy;
use crate::config::policy::PolicyError;
use crate::domain::engine::GovernanceEngine;

/// Re-applies the policy document whenever its file changes.
///
/// The parent directory is watched so editors that replace the file by
/// rename are noticed. A periodic re-read covers missed notifications.
pub struct PolicyWatcher {
    path: PathBuf,
    engine: Arc<GovernanceEngine>,
    poll_interval: Duration,
    /// Last document applied, to skip rewrites with identical content
    applied: Option<PolicyDocument>,
    generation: u64,
}

impl PolicyWatcher {
    pub fn new(path: PathBuf, engine: Arc<GovernanceEngine>, poll_interval: Duration) -> Self {
        Self {
            path,
            engine,
            poll_interval,
            applied: None,
            generation: 0,
        }
    }

    /// Marks `policy` as already applied, e.g. by engine initialization.
    pub fn with_applied(mut self, policy: PolicyDocument) -> Self {
        self.applied = Some(policy);
        self.generation = 1;
        self
    }

    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn run(mut self, cancellation_token: CancellationToken) -> Result<(), Report<PolicyError>> {
        info!("Starting policy watcher");
        let (fs_tx, mut fs_rx) = mpsc::channel::<Event>(16);
        let _watcher = self.setup_filesystem_watcher(fs_tx)?;
        let mut poll = tokio::time::interval(self.poll_interval);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Policy watcher shutdown requested");
                    break;
                }
                Some(event) = fs_rx.recv() => {
                    if !event.paths.iter().any(|p| p.file_name() == self.path.file_name()) {
                        continue;
                    }
                    debug!("Policy file event detected");
                    if let Err(e) = self.reload().await {
                        error!("Failed to reload policy after filesystem event: {e:?}");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.reload().await {
                        error!("Failed to reload policy during periodic check: {e:?}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads the document and applies it when it differs from the last one
    /// applied. Returns whether it was applied.
    pub async fn reload(&mut self) -> Result<bool, Report<PolicyError>> {
        let policy = load_policy(&self.path).await?;
        if self.applied.as_ref() == Some(&policy) {
            return Ok(false);
        }
        if !policy.devices.is_empty() && self.generation > 0 {
            warn!("Static devices in the policy are only read at startup");
        }

        let outcome = self
            .engine
            .apply_policy(&policy)
            .await
            .change_context(PolicyError::Invalid)?;
        self.generation += 1;
        for rejected in &outcome.rejected {
            warn!(generation = self.generation, "Declaration skipped: {rejected}");
        }
        for pending in &outcome.pending {
            info!(generation = self.generation, "Waiting for a suitable device: {pending}");
        }
        info!(
            generation = self.generation,
            profiles = policy.profiles.len(),
            quotas = policy.quotas.len(),
            desired_schemes = policy.desired_schemes.len(),
            "Policy applied"
        );
        self.applied = Some(policy);
        Ok(true)
    }

    fn setup_filesystem_watcher(
        &self,
        fs_tx: mpsc::Sender<Event>,
    ) -> Result<RecommendedWatcher, Report<PolicyError>> {
        let watch_error = || PolicyError::Read {
            path: self.path.display().to_string(),
        };
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Filesystem watch error: {:?}", e),
            },
            Config::default(),
        )
        .change_context_lazy(watch_error)?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .change_context_lazy(watch_error)
            .attach_printable_lazy(|| format!("directory: {}", dir.display()))?;

        tokio::task::spawn_blocking(move || {
            while let Ok(event) = rx.recv() {
                let send_result = tokio::runtime::Handle::current().block_on(fs_tx.send(event));
                if send_result.is_err() {
                    break;
                }
            }
        });

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::clock::SystemClock;
    use crate::domain::engine::EngineSettings;
    use crate::infrastructure::local_orchestrator::LocalOrchestrator;
    use crate::infrastructure::state_store::MemoryStateStore;

    const DEVICES: &str = r#"
devices:
  - node: dev-node
    index: 0
    totalMemoryMib: 24576
"#;

    fn engine() -> Arc<GovernanceEngine> {
        Arc::new(GovernanceEngine::new(
            EngineSettings::default(),
            Arc::new(LocalOrchestrator::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(SystemClock),
        ))
    }

    fn policy_with_profile(name: &str) -> String {
        format!(
            r#"{DEVICES}
profiles:
  - name: {name}
    identifier: nvidia.com/gpu
quotas:
  - team: vision
    nominalUnits: 2
"#
        )
    }

    async fn initialized(path: &std::path::Path) -> (Arc<GovernanceEngine>, PolicyDocument) {
        let engine = engine();
        let policy = load_policy(path).await.unwrap();
        engine.initialize(Vec::new(), &policy).await.unwrap();
        (engine, policy)
    }

    #[tokio::test]
    async fn reload_applies_only_changed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, policy_with_profile("whole-gpu")).unwrap();
        let (engine, policy) = initialized(&path).await;

        let mut watcher =
            PolicyWatcher::new(path.clone(), engine.clone(), Duration::from_secs(60)).with_applied(policy);
        assert!(!watcher.reload().await.unwrap());

        std::fs::write(&path, policy_with_profile("full-gpu")).unwrap();
        assert!(watcher.reload().await.unwrap());
        let names: Vec<String> = engine.profiles().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["full-gpu".to_string()]);

        std::fs::write(&path, "profiles: [").unwrap();
        let err = watcher.reload().await.unwrap_err();
        assert!(matches!(err.current_context(), PolicyError::Parse { .. }));
        assert_eq!(engine.profiles().len(), 1);
        engine.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn run_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, policy_with_profile("whole-gpu")).unwrap();
        let (engine, policy) = initialized(&path).await;

        let token = CancellationToken::new();
        let watcher =
            PolicyWatcher::new(path.clone(), engine.clone(), Duration::from_millis(200)).with_applied(policy);
        let task = tokio::spawn(watcher.run(token.clone()));

        std::fs::write(&path, policy_with_profile("full-gpu")).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.profiles().first().map(|p| p.name.as_str()) != Some("full-gpu") {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        task.await.unwrap().unwrap();
        engine.shutdown().await;
    }
}
