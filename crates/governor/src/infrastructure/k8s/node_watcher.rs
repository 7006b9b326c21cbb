use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use api_types::DeviceHealth;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::types::KubernetesError;
use super::types::GPU_COMPUTE_MAJOR_LABEL;
use super::types::GPU_COMPUTE_MINOR_LABEL;
use super::types::GPU_COUNT_LABEL;
use super::types::GPU_MEMORY_LABEL;
use super::types::GPU_NODE_SELECTOR;
use super::types::GPU_PRODUCT_LABEL;
use super::types::MIG_CAPABLE_LABEL;
use crate::domain::events::DeviceEvent;
use crate::domain::inventory::ComputeCapability;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::GpuDevice;
use crate::infrastructure::kube_client;

/// Device indices last reported per node
type KnownDevices = HashMap<String, BTreeSet<u32>>;

/// Watches GPU nodes and reports their devices.
///
/// Devices come from GPU feature-discovery labels; health follows the node's
/// `Ready` condition. Devices that disappear from a node, or whose node is
/// deleted, are reported as removed.
pub struct NodeDeviceWatcher {
    kubeconfig: Option<PathBuf>,
}

impl NodeDeviceWatcher {
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self { kubeconfig }
    }

    /// Watches until cancelled, restarting the watch after failures.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        sender: mpsc::Sender<DeviceEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting node device watcher");
        let client = kube_client::init_kube_client(self.kubeconfig.clone()).await?;
        let mut known = KnownDevices::new();
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Node device watcher shutdown requested");
                    break;
                }
                result = self.watch_nodes(&client, &mut known, &sender) => {
                    match result {
                        Ok(()) => warn!("Node watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Node watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch_nodes(
        &self,
        client: &Client,
        known: &mut KnownDevices,
        sender: &mpsc::Sender<DeviceEvent>,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(client.clone());
        let config = Config::default().labels(GPU_NODE_SELECTOR);
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_event(event, known, sender).await,
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }
        Ok(())
    }

    async fn handle_event(
        &self,
        event: Event<Node>,
        known: &mut KnownDevices,
        sender: &mpsc::Sender<DeviceEvent>,
    ) {
        match event {
            Event::Applied(node) => {
                if let Err(e) = self.apply_node(&node, known, sender).await {
                    warn!("Ignoring node update: {e:?}");
                }
            }
            Event::Deleted(node) => {
                if let Some(name) = node.metadata.name.as_deref() {
                    self.forget_node(name, known, sender).await;
                }
            }
            Event::Restarted(nodes) => {
                let present: HashSet<&str> = nodes
                    .iter()
                    .filter_map(|node| node.metadata.name.as_deref())
                    .collect();
                let vanished: Vec<String> = known
                    .keys()
                    .filter(|name| !present.contains(name.as_str()))
                    .cloned()
                    .collect();
                for name in vanished {
                    self.forget_node(&name, known, sender).await;
                }
                for node in &nodes {
                    if let Err(e) = self.apply_node(node, known, sender).await {
                        warn!("Ignoring node: {e:?}");
                    }
                }
            }
        }
    }

    async fn apply_node(
        &self,
        node: &Node,
        known: &mut KnownDevices,
        sender: &mpsc::Sender<DeviceEvent>,
    ) -> Result<(), Report<KubernetesError>> {
        let Some(name) = node.metadata.name.clone() else {
            return Ok(());
        };
        let devices = devices_from_node(node)?;
        let current: BTreeSet<u32> = devices.iter().map(|d| d.id.index).collect();
        let previous = known.insert(name.clone(), current.clone()).unwrap_or_default();

        for index in previous.difference(&current) {
            send(sender, DeviceEvent::Removed(DeviceId::new(name.clone(), *index))).await;
        }
        debug!(node = %name, devices = devices.len(), "GPU node observed");
        for device in devices {
            send(sender, DeviceEvent::Observed(device)).await;
        }
        Ok(())
    }

    async fn forget_node(&self, name: &str, known: &mut KnownDevices, sender: &mpsc::Sender<DeviceEvent>) {
        let Some(indices) = known.remove(name) else {
            return;
        };
        info!(node = %name, devices = indices.len(), "GPU node gone");
        for index in indices {
            send(sender, DeviceEvent::Removed(DeviceId::new(name, index))).await;
        }
    }
}

async fn send(sender: &mpsc::Sender<DeviceEvent>, event: DeviceEvent) {
    if let Err(e) = sender.send(event).await {
        warn!("Failed to send device event: {e}");
    }
}

/// Devices advertised by a node's feature-discovery labels.
pub fn devices_from_node(node: &Node) -> Result<Vec<GpuDevice>, Report<KubernetesError>> {
    let name = node.metadata.name.clone().unwrap_or_default();
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);

    let Some(count) = parse_label::<u32>(labels, GPU_COUNT_LABEL, &name)? else {
        return Ok(Vec::new());
    };
    let total_memory_mib = parse_label::<u64>(labels, GPU_MEMORY_LABEL, &name)?.ok_or_else(|| {
        Report::new(KubernetesError::LabelParseError {
            node: name.clone(),
            message: format!("missing {GPU_MEMORY_LABEL}"),
        })
    })?;
    let compute = ComputeCapability {
        major: parse_label(labels, GPU_COMPUTE_MAJOR_LABEL, &name)?.unwrap_or(0),
        minor: parse_label(labels, GPU_COMPUTE_MINOR_LABEL, &name)?.unwrap_or(0),
    };
    let mig_capable = parse_label::<bool>(labels, MIG_CAPABLE_LABEL, &name)?.unwrap_or(false);
    let product = labels.get(GPU_PRODUCT_LABEL).cloned().unwrap_or_default();
    let health = node_health(node);

    Ok((0..count)
        .map(|index| GpuDevice {
            id: DeviceId::new(name.clone(), index),
            product: product.clone(),
            total_memory_mib,
            compute,
            mig_capable,
            health,
        })
        .collect())
}

fn parse_label<T: FromStr>(
    labels: &BTreeMap<String, String>,
    key: &str,
    node: &str,
) -> Result<Option<T>, Report<KubernetesError>>
where
    T::Err: std::fmt::Display,
{
    labels
        .get(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| {
                Report::new(KubernetesError::LabelParseError {
                    node: node.to_string(),
                    message: format!("{key}={value}: {e}"),
                })
            })
        })
        .transpose()
}

fn node_health(node: &Node) -> DeviceHealth {
    let ready = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|condition| condition.status.as_str());
    match ready {
        Some("True") => DeviceHealth::Healthy,
        Some("False") => DeviceHealth::Degraded,
        _ => DeviceHealth::Unreachable,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeCondition;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn gpu_node(name: &str, count: u32, ready: &str) -> Node {
        let labels = BTreeMap::from([
            (GPU_COUNT_LABEL.to_string(), count.to_string()),
            (GPU_MEMORY_LABEL.to_string(), "40960".to_string()),
            (GPU_PRODUCT_LABEL.to_string(), "NVIDIA-A100-SXM4-40GB".to_string()),
            (GPU_COMPUTE_MAJOR_LABEL.to_string(), "8".to_string()),
            (GPU_COMPUTE_MINOR_LABEL.to_string(), "0".to_string()),
            (MIG_CAPABLE_LABEL.to_string(), "true".to_string()),
        ]);
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn parses_feature_discovery_labels() {
        let devices = devices_from_node(&gpu_node("node-a", 2, "True")).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].id, DeviceId::new("node-a", 1));
        assert_eq!(devices[0].total_memory_mib, 40960);
        assert_eq!(devices[0].compute, ComputeCapability { major: 8, minor: 0 });
        assert!(devices[0].mig_capable);
        assert_eq!(devices[0].health, DeviceHealth::Healthy);

        let degraded = devices_from_node(&gpu_node("node-a", 1, "False")).unwrap();
        assert_eq!(degraded[0].health, DeviceHealth::Degraded);
        let unknown = devices_from_node(&gpu_node("node-a", 1, "Unknown")).unwrap();
        assert_eq!(unknown[0].health, DeviceHealth::Unreachable);
    }

    #[test]
    fn rejects_malformed_labels() {
        let mut node = gpu_node("node-a", 1, "True");
        node.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(GPU_MEMORY_LABEL.to_string(), "lots".to_string());
        assert!(devices_from_node(&node).is_err());

        node.metadata.labels.as_mut().unwrap().remove(GPU_COUNT_LABEL);
        assert!(devices_from_node(&node).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reports_vanished_devices_and_nodes() {
        let watcher = NodeDeviceWatcher::new(None);
        let (tx, mut rx) = mpsc::channel(32);
        let mut known = KnownDevices::new();

        watcher
            .handle_event(Event::Applied(gpu_node("node-a", 2, "True")), &mut known, &tx)
            .await;
        assert_eq!(drain(&mut rx).len(), 2);

        watcher
            .handle_event(Event::Applied(gpu_node("node-a", 1, "True")), &mut known, &tx)
            .await;
        let events = drain(&mut rx);
        assert_eq!(events[0], DeviceEvent::Removed(DeviceId::new("node-a", 1)));
        assert_eq!(events.len(), 2);

        watcher
            .handle_event(Event::Restarted(vec![gpu_node("node-b", 1, "True")]), &mut known, &tx)
            .await;
        let events = drain(&mut rx);
        assert_eq!(events[0], DeviceEvent::Removed(DeviceId::new("node-a", 0)));
        assert!(matches!(&events[1], DeviceEvent::Observed(d) if d.id == DeviceId::new("node-b", 0)));

        watcher
            .handle_event(Event::Deleted(gpu_node("node-b", 1, "True")), &mut known, &tx)
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![DeviceEvent::Removed(DeviceId::new("node-b", 0))]
        );
        assert!(known.is_empty());
    }
}
