use core::error::Error;

/// Node annotation carrying the declared scheme of device `<index>`.
pub const PARTITION_ANNOTATION_PREFIX: &str = "gpu-governor.io/partition.";
/// Node annotation where the node agent reports the realized unit shape of
/// device `<index>` as a JSON object of resource name to count.
pub const REALIZED_ANNOTATION_PREFIX: &str = "gpu-governor.io/realized.";
/// Pod annotation naming the GPU index a workload is bound to.
pub const DEVICE_ANNOTATION: &str = "gpu-governor.io/device";
/// Pod label carrying the admitted workload request id.
pub const WORKLOAD_LABEL: &str = "gpu-governor.io/workload";

/// Label selecting nodes with GPUs.
pub const GPU_NODE_SELECTOR: &str = "nvidia.com/gpu.present=true";
pub const GPU_COUNT_LABEL: &str = "nvidia.com/gpu.count";
pub const GPU_MEMORY_LABEL: &str = "nvidia.com/gpu.memory";
pub const GPU_PRODUCT_LABEL: &str = "nvidia.com/gpu.product";
pub const GPU_COMPUTE_MAJOR_LABEL: &str = "nvidia.com/gpu.compute.major";
pub const GPU_COMPUTE_MINOR_LABEL: &str = "nvidia.com/gpu.compute.minor";
pub const MIG_CAPABLE_LABEL: &str = "nvidia.com/mig.capable";

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch nodes: {message}")]
    WatchFailed { message: String },
    #[display("Failed to parse node labels of {node}: {message}")]
    LabelParseError { node: String, message: String },
    #[display("Failed to patch node {node}")]
    PatchFailed { node: String },
    #[display("Failed to list pods on node {node}")]
    ListFailed { node: String },
    #[display("Failed to evict pod {pod} in namespace {namespace}")]
    EvictionFailed { pod: String, namespace: String },
}

impl Error for KubernetesError {}
