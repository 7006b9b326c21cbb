//! Adapters between the governance engine and the outside world

pub mod k8s;
pub mod kube_client;
pub mod local_orchestrator;
pub mod nvml_feed;
pub mod policy_watcher;
pub mod state_store;
