use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::app::core::Application;
use crate::app::services::DeviceFeed;
use crate::domain::engine::GovernanceEngine;
use crate::domain::events::DeviceEvent;
use crate::infrastructure::policy_watcher::PolicyWatcher;

const DEVICE_EVENT_BUFFER: usize = 256;
const POLICY_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let engine_task = self.spawn_engine_task(app);
        self.tasks.push(engine_task);

        let (event_sender, event_receiver) = mpsc::channel::<DeviceEvent>(DEVICE_EVENT_BUFFER);
        if let Some(feed_task) = self.spawn_device_feed_task(app, event_sender) {
            self.tasks.push(feed_task);
        }
        let dispatch_task = self.spawn_event_dispatch_task(event_receiver, app.services().engine.clone());
        self.tasks.push(dispatch_task);

        if let Some(policy_task) = self.spawn_policy_watcher_task(app) {
            self.tasks.push(policy_task);
        }

        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_engine_task(&self, app: &Application) -> JoinHandle<()> {
        let engine = app.services().engine.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting governance engine task");
            engine.run(token).await;
            tracing::info!("Governance engine task completed");
        })
    }

    fn spawn_device_feed_task(
        &self,
        app: &Application,
        sender: mpsc::Sender<DeviceEvent>,
    ) -> Option<JoinHandle<()>> {
        let token = self.cancellation_token.clone();
        match &app.services().device_feed {
            DeviceFeed::Kube(watcher) => {
                let watcher = watcher.clone();
                Some(tokio::spawn(async move {
                    tracing::info!("Starting node device watcher task");
                    if let Err(e) = watcher.run(sender, token).await {
                        tracing::error!("Node device watcher failed: {e:?}");
                    } else {
                        tracing::info!("Node device watcher completed");
                    }
                }))
            }
            DeviceFeed::Nvml(feed) => {
                let feed = feed.clone();
                Some(tokio::spawn(async move {
                    tracing::info!("Starting NVML device feed task");
                    feed.run(sender, token).await;
                    tracing::info!("NVML device feed task completed");
                }))
            }
            DeviceFeed::Static => None,
        }
    }

    fn spawn_event_dispatch_task(
        &self,
        mut receiver: mpsc::Receiver<DeviceEvent>,
        engine: Arc<GovernanceEngine>,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting device event dispatch task");
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Some(event) => engine.dispatch(event).await,
                        None => {
                            // static source, or the feed stopped; keep running until cancelled
                            token.cancelled().await;
                            break;
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
            tracing::info!("Device event dispatch task completed");
        })
    }

    fn spawn_policy_watcher_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let path = app.daemon_args().policy_file.clone()?;
        let watcher = PolicyWatcher::new(path, app.services().engine.clone(), POLICY_POLL_INTERVAL)
            .with_applied(app.services().initial_policy.clone());
        let token = self.cancellation_token.clone();
        Some(tokio::spawn(async move {
            tracing::info!("Starting policy watcher task");
            if let Err(e) = watcher.run(token).await {
                tracing::error!("Policy watcher failed: {e:?}");
            } else {
                tracing::info!("Policy watcher completed");
            }
        }))
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let listen_addr = app.daemon_args().api_listen_addr.clone();
        let api_server = ApiServer::new(
            app.services().engine.clone(),
            app.services().readiness.clone(),
            listen_addr,
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}
