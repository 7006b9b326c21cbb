use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::EvictParams;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::types::KubernetesError;
use super::types::DEVICE_ANNOTATION;
use super::types::PARTITION_ANNOTATION_PREFIX;
use super::types::REALIZED_ANNOTATION_PREFIX;
use super::types::WORKLOAD_LABEL;
use crate::domain::inventory::DeviceId;
use crate::domain::inventory::PartitionScheme;
use crate::domain::inventory::UnitId;
use crate::domain::partition::Orchestrator;
use crate::domain::partition::OrchestratorError;
use crate::domain::partition::RealizedShape;

/// Orchestrator backed by the Kubernetes API.
///
/// Cordons through `spec.unschedulable`, evicts through the eviction
/// subresource so disruption budgets apply, and exchanges scheme
/// declarations and realized shapes with the node agent via node annotations.
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<(), Report<KubernetesError>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::PatchFailed {
                node: node.to_string(),
            })?;
        info!(node, unschedulable, "Node schedulability updated");
        Ok(())
    }

    async fn device_pods(&self, device: &DeviceId) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", device.node));
        let list = pods.list(&params).await.change_context(KubernetesError::ListFailed {
            node: device.node.clone(),
        })?;
        Ok(list
            .items
            .into_iter()
            .filter(|pod| bound_to_device(pod, device.index) && !is_terminated(pod))
            .collect())
    }

    async fn evict_pods(&self, pods: Vec<Pod>) -> Result<(), Report<KubernetesError>> {
        for pod in pods {
            let (Some(name), Some(namespace)) = (pod.metadata.name, pod.metadata.namespace) else {
                continue;
            };
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            match api.evict(&name, &EvictParams::default()).await {
                Ok(_) => info!(pod = %name, namespace = %namespace, "Pod eviction requested"),
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    debug!(pod = %name, namespace = %namespace, "Pod already gone");
                }
                // Disruption budget exhausted; drain polling retries later
                Err(kube::Error::Api(response)) if response.code == 429 => {
                    warn!(pod = %name, namespace = %namespace, "Eviction deferred by disruption budget");
                }
                Err(e) => {
                    return Err(Report::new(e).change_context(KubernetesError::EvictionFailed {
                        pod: name,
                        namespace,
                    }));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn cordon(&self, node: &str) -> Result<(), Report<OrchestratorError>> {
        self.set_unschedulable(node, true)
            .await
            .change_context(OrchestratorError::Cordon {
                node: node.to_string(),
            })
    }

    async fn uncordon(&self, node: &str) -> Result<(), Report<OrchestratorError>> {
        self.set_unschedulable(node, false)
            .await
            .change_context(OrchestratorError::Uncordon {
                node: node.to_string(),
            })
    }

    async fn evict_device_workloads(&self, device: &DeviceId) -> Result<(), Report<OrchestratorError>> {
        let eviction_error = || OrchestratorError::Eviction {
            message: format!("workloads on {device}"),
        };
        let pods = self.device_pods(device).await.change_context_lazy(eviction_error)?;
        debug!(device = %device, pods = pods.len(), "Evicting device workloads");
        self.evict_pods(pods).await.change_context_lazy(eviction_error)
    }

    async fn evict_workload(
        &self,
        workload: &str,
        units: &[UnitId],
    ) -> Result<(), Report<OrchestratorError>> {
        let eviction_error = || OrchestratorError::Eviction {
            message: format!("workload {workload}"),
        };
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{WORKLOAD_LABEL}={workload}"));
        let list = pods
            .list(&params)
            .await
            .change_context(KubernetesError::ListFailed {
                node: "*".to_string(),
            })
            .change_context_lazy(eviction_error)?;
        let victims: Vec<Pod> = list.items.into_iter().filter(|pod| !is_terminated(pod)).collect();
        info!(workload, units = units.len(), pods = victims.len(), "Evicting preempted workload");
        self.evict_pods(victims).await.change_context_lazy(eviction_error)
    }

    async fn drain_complete(&self, device: &DeviceId) -> Result<bool, Report<OrchestratorError>> {
        let pods = self
            .device_pods(device)
            .await
            .change_context(OrchestratorError::Eviction {
                message: format!("drain status of {device}"),
            })?;
        Ok(pods.is_empty())
    }

    async fn apply_scheme(
        &self,
        device: &DeviceId,
        scheme: &PartitionScheme,
    ) -> Result<(), Report<OrchestratorError>> {
        let apply_error = || OrchestratorError::Apply {
            device: device.to_string(),
        };
        let declaration = serde_json::to_string(&scheme.to_spec()).change_context_lazy(apply_error)?;
        let patch = json!({
            "metadata": { "annotations": { scheme_annotation(device.index): declaration } }
        });
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(&device.node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::PatchFailed {
                node: device.node.clone(),
            })
            .change_context_lazy(apply_error)?;
        info!(device = %device, scheme = %scheme, "Partition scheme published");
        Ok(())
    }

    async fn realized_shape(
        &self,
        device: &DeviceId,
    ) -> Result<Option<RealizedShape>, Report<OrchestratorError>> {
        let read_error = || OrchestratorError::ReadShape {
            device: device.to_string(),
        };
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(&device.node).await.change_context_lazy(read_error)?;
        realized_from_node(&node, device.index).change_context_lazy(read_error)
    }
}

fn scheme_annotation(index: u32) -> String {
    format!("{PARTITION_ANNOTATION_PREFIX}{index}")
}

fn bound_to_device(pod: &Pod, index: u32) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DEVICE_ANNOTATION))
        .and_then(|value| value.trim().parse::<u32>().ok())
        == Some(index)
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Reads the shape the node agent reported for device `index`.
fn realized_from_node(node: &Node, index: u32) -> Result<Option<RealizedShape>, Report<KubernetesError>> {
    let key = format!("{REALIZED_ANNOTATION_PREFIX}{index}");
    let Some(raw) = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&key))
    else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .change_context(KubernetesError::LabelParseError {
            node: node.metadata.name.clone().unwrap_or_default(),
            message: format!("annotation {key}"),
        })
        .attach_printable_lazy(|| format!("value: {raw}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn pod(device: Option<&str>, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("trainer".to_string()),
                namespace: Some("ml".to_string()),
                annotations: device.map(|d| BTreeMap::from([(DEVICE_ANNOTATION.to_string(), d.to_string())])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn node_with(annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    #[test]
    fn matches_pods_by_device_annotation() {
        assert!(bound_to_device(&pod(Some("1"), "Running"), 1));
        assert!(!bound_to_device(&pod(Some("0"), "Running"), 1));
        assert!(!bound_to_device(&pod(Some("gpu-1"), "Running"), 1));
        assert!(!bound_to_device(&pod(None, "Running"), 0));
    }

    #[test]
    fn finished_pods_do_not_block_drain() {
        assert!(is_terminated(&pod(Some("0"), "Succeeded")));
        assert!(is_terminated(&pod(Some("0"), "Failed")));
        assert!(!is_terminated(&pod(Some("0"), "Pending")));
        assert!(!is_terminated(&pod(Some("0"), "Running")));
    }

    #[test]
    fn reads_realized_shape_annotation() {
        let node = node_with(&[(
            "gpu-governor.io/realized.1",
            r#"{"nvidia.com/mig-1g.5gb": 7}"#,
        )]);
        let shape = realized_from_node(&node, 1).unwrap().unwrap();
        assert_eq!(shape, RealizedShape::from([("nvidia.com/mig-1g.5gb".to_string(), 7)]));
        assert_eq!(realized_from_node(&node, 0).unwrap(), None);

        let broken = node_with(&[("gpu-governor.io/realized.0", "seven")]);
        assert!(realized_from_node(&broken, 0).is_err());
    }

    #[test]
    fn scheme_annotation_is_per_device() {
        assert_eq!(scheme_annotation(3), "gpu-governor.io/partition.3");
    }
}
