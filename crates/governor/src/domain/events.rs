//! Per-device event routing
//!
//! Device feed events are handed to one worker task per device. Events of a
//! device are handled in arrival order; different devices proceed in
//! parallel.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::inventory::DeviceId;
use super::inventory::GpuDevice;
use super::partition::PartitionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device is present with these properties and health
    Observed(GpuDevice),
    /// The device disappeared
    Removed(DeviceId),
    /// Units on the device were released or a deadline may have passed
    Step(DeviceId),
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceId {
        match self {
            Self::Observed(device) => &device.id,
            Self::Removed(id) | Self::Step(id) => id,
        }
    }
}

#[async_trait]
pub trait DeviceEventHandler: Send + Sync {
    async fn handle(&self, event: DeviceEvent);
}

#[async_trait]
impl DeviceEventHandler for PartitionManager {
    async fn handle(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Observed(device) => self.observe_device(device).await,
            DeviceEvent::Removed(id) => {
                self.remove_device(&id).await;
            }
            DeviceEvent::Step(id) => self.step_device(&id).await,
        }
    }
}

struct Worker {
    sender: mpsc::Sender<DeviceEvent>,
    task: JoinHandle<()>,
    generation: u64,
}

/// Routes device events to per-device workers.
///
/// A worker retires after handling the removal of its device. Events racing
/// with the retirement are still handled by the old worker or by a fresh one.
pub struct DeviceEventRouter {
    handler: Arc<dyn DeviceEventHandler>,
    workers: Arc<DashMap<DeviceId, Worker>>,
    generations: AtomicU64,
    buffer: usize,
    token: CancellationToken,
}

impl DeviceEventRouter {
    pub fn new(handler: Arc<dyn DeviceEventHandler>, buffer: usize) -> Self {
        Self {
            handler,
            workers: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
            buffer: buffer.max(1),
            token: CancellationToken::new(),
        }
    }

    /// Queues an event for its device's worker, starting the worker on first
    /// use. Waits while that worker's buffer is full.
    pub async fn dispatch(&self, event: DeviceEvent) {
        let mut event = event;
        loop {
            if self.token.is_cancelled() {
                debug!(device = %event.device(), "Router stopped, dropping device event");
                return;
            }
            let sender = self
                .workers
                .entry(event.device().clone())
                .or_insert_with(|| self.spawn_worker(event.device().clone()))
                .sender
                .clone();
            match sender.send(event).await {
                Ok(()) => return,
                // the worker retired after a removal; hand the event to a new one
                Err(e) => event = e.0,
            }
        }
    }

    fn spawn_worker(&self, id: DeviceId) -> Worker {
        let (sender, mut receiver) = mpsc::channel(self.buffer);
        let handler = self.handler.clone();
        let workers = self.workers.clone();
        let token = self.token.clone();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            debug!(device = %id, generation, "Device worker started");
            loop {
                select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(DeviceEvent::Removed(removed)) => {
                            handler.handle(DeviceEvent::Removed(removed)).await;
                            workers.remove_if(&id, |_, worker| worker.generation == generation);
                            receiver.close();
                            while let Some(event) = receiver.recv().await {
                                handler.handle(event).await;
                            }
                            break;
                        }
                        Some(event) => handler.handle(event).await,
                        None => break,
                    },
                }
            }
            debug!(device = %id, generation, "Device worker stopped");
        });
        Worker {
            sender,
            task,
            generation,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops all workers. Events still buffered are dropped.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let ids: Vec<DeviceId> = self.workers.iter().map(|w| w.key().clone()).collect();
        let tasks: Vec<JoinHandle<()>> = ids
            .iter()
            .filter_map(|id| self.workers.remove(id))
            .map(|(_, worker)| worker.task)
            .collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Device worker ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<DeviceEvent>>,
        /// Events of this device wait until `release` is notified
        held: Option<DeviceId>,
        release: Notify,
        done: Notify,
    }

    #[async_trait]
    impl DeviceEventHandler for Recorder {
        async fn handle(&self, event: DeviceEvent) {
            if self.held.as_ref() == Some(event.device()) {
                self.release.notified().await;
            }
            self.seen.lock().unwrap().push(event);
            self.done.notify_one();
        }
    }

    fn step(node: &str) -> DeviceEvent {
        DeviceEvent::Step(DeviceId::new(node, 0))
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.seen.lock().unwrap().len() < count {
                recorder.done.notified().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn events_of_one_device_keep_their_order() {
        let recorder = Arc::new(Recorder::default());
        let router = DeviceEventRouter::new(recorder.clone(), 8);
        let id = DeviceId::new("node-a", 0);

        router.dispatch(DeviceEvent::Step(id.clone())).await;
        router.dispatch(DeviceEvent::Removed(id.clone())).await;
        router.dispatch(DeviceEvent::Step(id.clone())).await;
        wait_for(&recorder, 3).await;

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                DeviceEvent::Step(id.clone()),
                DeviceEvent::Removed(id.clone()),
                DeviceEvent::Step(id),
            ]
        );
        router.shutdown().await;
    }

    #[tokio::test]
    async fn removed_device_retires_its_worker() {
        let recorder = Arc::new(Recorder::default());
        let router = DeviceEventRouter::new(recorder.clone(), 8);
        let gone = DeviceId::new("node-a", 0);

        router.dispatch(DeviceEvent::Step(gone.clone())).await;
        router.dispatch(step("node-b")).await;
        router.dispatch(DeviceEvent::Removed(gone.clone())).await;
        wait_for(&recorder, 3).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while router.worker_count() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        router.dispatch(DeviceEvent::Step(gone.clone())).await;
        wait_for(&recorder, 4).await;
        assert_eq!(
            recorder.seen.lock().unwrap().last(),
            Some(&DeviceEvent::Step(gone))
        );
        assert_eq!(router.worker_count(), 2);
        router.shutdown().await;
    }

    #[tokio::test]
    async fn slow_device_does_not_hold_up_others() {
        let recorder = Arc::new(Recorder {
            held: Some(DeviceId::new("slow", 0)),
            ..Default::default()
        });
        let router = DeviceEventRouter::new(recorder.clone(), 8);

        router.dispatch(step("slow")).await;
        router.dispatch(step("fast")).await;
        wait_for(&recorder, 1).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![step("fast")]);

        recorder.release.notify_one();
        wait_for(&recorder, 2).await;
        assert_eq!(router.worker_count(), 2);
        router.shutdown().await;
        assert_eq!(router.worker_count(), 0);
    }

    #[tokio::test]
    async fn stopped_router_drops_events() {
        let recorder = Arc::new(Recorder::default());
        let router = DeviceEventRouter::new(recorder.clone(), 8);
        router.shutdown().await;

        router.dispatch(step("node-a")).await;
        assert_eq!(router.worker_count(), 0);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
