//! Loading and offline checking of the declarative policy document

use core::error::Error;
use std::path::Path;
use std::sync::Arc;

use api_types::PolicyDocument;
use error_stack::Report;
use error_stack::ResultExt;
use schemars::schema_for;

use crate::domain::clock::SystemClock;
use crate::domain::engine::EngineSettings;
use crate::domain::engine::GovernanceEngine;
use crate::domain::engine::PolicyOutcome;
use crate::infrastructure::local_orchestrator::LocalOrchestrator;
use crate::infrastructure::state_store::MemoryStateStore;

#[derive(Debug, derive_more::Display)]
pub enum PolicyError {
    #[display("Failed to read policy file {path}")]
    Read { path: String },
    #[display("Failed to parse policy file {path}")]
    Parse { path: String },
    #[display("Policy is invalid")]
    Invalid,
    #[display("Failed to render policy schema")]
    Schema,
}

impl Error for PolicyError {}

pub fn parse_policy(text: &str) -> Result<PolicyDocument, serde_yaml::Error> {
    if text.trim().is_empty() {
        return Ok(PolicyDocument::default());
    }
    serde_yaml::from_str(text)
}

pub async fn load_policy(path: &Path) -> Result<PolicyDocument, Report<PolicyError>> {
    let display = path.display().to_string();
    let text = tokio::fs::read_to_string(path)
        .await
        .change_context(PolicyError::Read {
            path: display.clone(),
        })?;
    parse_policy(&text).change_context(PolicyError::Parse { path: display })
}

/// Checks a policy against the devices it declares statically.
///
/// The document is applied to a throwaway engine that realizes schemes in
/// memory, so the outcome matches what the daemon would accept for the same
/// fleet. An invalid quota set fails; other rejected declarations, and
/// profiles none of the declared devices can serve, are listed in the
/// outcome.
pub async fn validate_offline(
    policy: &PolicyDocument,
    headroom_mib: u64,
) -> Result<PolicyOutcome, Report<PolicyError>> {
    let settings = EngineSettings {
        headroom_mib,
        ..EngineSettings::default()
    };
    let engine = GovernanceEngine::new(
        settings,
        Arc::new(LocalOrchestrator::new()),
        Arc::new(MemoryStateStore::new()),
        Arc::new(SystemClock),
    );
    let outcome = engine
        .initialize(Vec::new(), policy)
        .await
        .change_context(PolicyError::Invalid);
    engine.shutdown().await;
    outcome
}

/// JSON schema of the policy document.
pub fn policy_schema() -> Result<String, Report<PolicyError>> {
    serde_json::to_string_pretty(&schema_for!(PolicyDocument)).change_context(PolicyError::Schema)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const POLICY: &str = r#"
devices:
  - node: dev-node
    index: 0
    product: NVIDIA A100-SXM4-40GB
    totalMemoryMib: 40960
    computeMajor: 8
    migCapable: true
desiredSchemes:
  - node: dev-node
    index: 0
    scheme:
      timeSliced: { replicas: 4 }
profiles:
  - name: shared-gpu
    identifier: nvidia.com/gpu.shared
    count: { min: 1, default: 1, max: 4 }
    limits: { memoryMib: 8192 }
  - name: mig-small
    identifier: nvidia.com/mig-1g.5gb
quotas:
  - team: vision
    nominalUnits: 4
    borrowingLimit: 2
"#;

    #[test]
    fn empty_policy_is_valid() {
        assert_eq!(parse_policy("").unwrap(), PolicyDocument::default());
        assert!(parse_policy("profiles: []\nunknown: 1").is_err());
    }

    #[tokio::test]
    async fn loads_policy_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, POLICY).unwrap();

        let policy = load_policy(&path).await.unwrap();
        assert_eq!(policy.profiles.len(), 2);
        assert_eq!(policy.quotas[0].priority_weight, 1);

        let missing = load_policy(&dir.path().join("missing.yaml")).await.unwrap_err();
        assert!(matches!(missing.current_context(), PolicyError::Read { .. }));
    }

    #[tokio::test]
    async fn offline_validation_reports_rejections() {
        let mut policy = parse_policy(POLICY).unwrap();
        assert!(validate_offline(&policy, 1024).await.unwrap().is_clean());

        policy.profiles[0].limits.memory_mib = Some(65536);
        let outcome = validate_offline(&policy, 1024).await.unwrap();
        assert!(!outcome.is_clean());
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.pending.len(), 1);
        assert!(outcome.pending[0].contains("shared-gpu"));

        policy.profiles[1].identifier = "google.com/tpu".into();
        let outcome = validate_offline(&policy, 1024).await.unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].contains("mig-small"));

        policy.quotas[0].priority_weight = 0;
        let err = validate_offline(&policy, 1024).await.unwrap_err();
        assert!(matches!(err.current_context(), PolicyError::Invalid));
    }

    #[test]
    fn schema_names_policy_sections() {
        let schema = policy_schema().unwrap();
        assert!(schema.contains("desiredSchemes"));
        assert!(schema.contains("quotas"));
    }
}
