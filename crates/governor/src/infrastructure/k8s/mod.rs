//! Kubernetes integration.
//!
//! - [`NodeDeviceWatcher`]: turns GPU feature-discovery labels on nodes into
//!   device events
//! - [`KubeOrchestrator`]: cordons nodes, evicts pods and exchanges partition
//!   schemes with the node agent through node annotations

pub mod node_watcher;
pub mod orchestrator;
pub mod types;

pub use node_watcher::NodeDeviceWatcher;
pub use orchestrator::KubeOrchestrator;
pub use types::KubernetesError;
