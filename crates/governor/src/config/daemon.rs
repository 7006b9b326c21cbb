use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Deserializer;

use crate::domain::admission::AdmissionPolicy;
use crate::domain::engine::EngineSettings;
use crate::domain::partition::PartitionSettings;

/// Where the daemon learns about GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceSource {
    /// Feature-discovery labels of cluster nodes
    Kube,
    /// GPUs of this machine through NVML
    Nvml,
    /// Devices listed in the policy document
    Static,
}

/// Governor tuning knobs, all optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorTuning {
    #[serde(deserialize_with = "deserialize_optional_from_string")]
    pub headroom_mib: Option<u64>,

    #[serde(deserialize_with = "deserialize_optional_from_string")]
    pub drain_timeout_secs: Option<u64>,

    #[serde(deserialize_with = "deserialize_optional_from_string")]
    pub verify_max_attempts: Option<u32>,

    #[serde(deserialize_with = "deserialize_optional_from_string")]
    pub verify_backoff_ms: Option<u64>,

    #[serde(deserialize_with = "deserialize_optional_from_string")]
    pub tick_interval_ms: Option<u64>,

    pub admission_policy: Option<AdmissionPolicy>,
}

impl GovernorTuning {
    /// Engine settings with every unset knob at its default.
    pub fn engine_settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        let partition = PartitionSettings {
            drain_timeout: self
                .drain_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.partition.drain_timeout),
            verify_max_attempts: self
                .verify_max_attempts
                .unwrap_or(defaults.partition.verify_max_attempts)
                .max(1),
            verify_backoff: self
                .verify_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.partition.verify_backoff),
        };
        EngineSettings {
            headroom_mib: self.headroom_mib.unwrap_or(defaults.headroom_mib),
            partition,
            policy: self.admission_policy.unwrap_or(defaults.policy),
            tick_interval: self
                .tick_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            event_buffer: defaults.event_buffer,
        }
    }
}

/// Accepts numbers given either as JSON numbers or as strings, as emitted
/// by operators that serialize every value as a string.
fn deserialize_optional_from_string<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + std::str::FromStr,
    T::Err: std::fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
    }

    match Option::<StringOrNumber<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrNumber::Number(n)) => Ok(Some(n)),
        Some(StringOrNumber::String(s)) => s.trim().parse::<T>().map(Some).map_err(|e| {
            serde::de::Error::custom(format!("Failed to parse number from string '{s}': {e}"))
        }),
    }
}

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "GOVERNOR_NODE_NAME",
        default_value = "local",
        help = "Node name reported for locally discovered GPUs"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "GOVERNOR_DEVICE_SOURCE",
        value_enum,
        default_value = "kube",
        help = "Where GPUs are discovered"
    )]
    pub device_source: DeviceSource,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "GOVERNOR_POLICY_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Policy document with profiles, quotas and desired schemes, watched for changes"
    )]
    pub policy_file: Option<PathBuf>,

    #[arg(
        long,
        env = "GOVERNOR_STATE_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for persisted partition state; state is kept in memory when absent"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "GOVERNOR_AUDIT_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Daily rolling file for admission and partition audit events, e.g. /logs/audit.log"
    )]
    pub audit_log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "GOVERNOR_NVML_POLL_MS",
        default_value = "5000",
        help = "Poll interval of the NVML device source in milliseconds"
    )]
    pub nvml_poll_ms: u64,

    #[arg(
        long,
        help = "Governor tuning as JSON string (headroomMib, drainTimeoutSecs, admissionPolicy, etc.)",
        env = "GOVERNOR_TUNING_CONFIG",
        value_parser = parse_tuning_config
    )]
    pub tuning_config: Option<GovernorTuning>,
}

impl DaemonArgs {
    pub fn engine_settings(&self) -> EngineSettings {
        self.tuning_config.clone().unwrap_or_default().engine_settings()
    }
}

/// Parse JSON string into GovernorTuning configuration
fn parse_tuning_config(s: &str) -> Result<GovernorTuning, String> {
    serde_json::from_str(s).map_err(|e| format!("Failed to parse tuning config JSON: {e}"))
}
