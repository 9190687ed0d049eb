//! Wire contracts the core consumes from the Builder and Auditor external
//! collaborators (§6.1). The core never parses free text from either party —
//! it only trusts these typed shapes, schema-validated on the way in.

use crate::model::Issue;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProbeResult {
    pub probe_id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BuilderResult {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    #[serde(with = "patch_bytes")]
    #[schemars(with = "String")]
    pub patch: Vec<u8>,
    pub proposed_files: Vec<String>,
    pub tokens_used: u64,
    pub probe_results: Vec<ProbeResult>,
    pub suggested_issues: Vec<Issue>,
    pub model_label: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditorVerdict {
    Accept,
    AcceptWithMinor,
    Reject,
}

impl AuditorVerdict {
    /// "Clean or only minor issues within tolerance" per §4.1 step 6 — the
    /// caller still has to check the minor count against
    /// `minor_issue_tolerance`; this only rules out an outright reject.
    pub fn is_acceptable(self) -> bool {
        matches!(self, AuditorVerdict::Accept | AuditorVerdict::AcceptWithMinor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AuditorResult {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub verdict: AuditorVerdict,
    pub review_notes: String,
    pub found_issues: Vec<Issue>,
    #[serde(default, with = "option_patch_bytes", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub suggested_patch: Option<Vec<u8>>,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
}

impl AuditorResult {
    /// Whether this result clears the Phase sub-loop per the
    /// `minor_issue_tolerance` configured for the phase's category.
    pub fn clears_gate(&self, minor_issue_tolerance: u32) -> bool {
        match self.verdict {
            AuditorVerdict::Accept => true,
            AuditorVerdict::AcceptWithMinor => {
                let minor_count = self
                    .found_issues
                    .iter()
                    .filter(|i| i.severity == crate::model::Severity::Minor)
                    .count() as u32;
                minor_count <= minor_issue_tolerance
            }
            AuditorVerdict::Reject => false,
        }
    }
}

mod patch_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

mod option_patch_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        bytes.as_ref().map(|b| STANDARD.encode(b)).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Contract the Supervisor uses to request a Builder attempt. The concrete
/// LLM/tool implementation is external — out of scope for the core.
#[async_trait]
pub trait BuilderClient: Send + Sync {
    async fn request_patch(&self, request: BuilderRequest) -> crate::error::Result<BuilderResult>;
}

#[async_trait]
pub trait AuditorClient: Send + Sync {
    async fn review(&self, request: AuditorRequest) -> crate::error::Result<AuditorResult>;
}

#[derive(Debug, Clone)]
pub struct BuilderRequest {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub task_category: String,
    pub scope_paths: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub learned_rules_context: Vec<String>,
    pub escalated: bool,
}

#[derive(Debug, Clone)]
pub struct AuditorRequest {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub patch: Vec<u8>,
    pub scope_paths: Vec<String>,
    pub learned_rules_context: Vec<String>,
    pub strictness: crate::model::AuditorStrictness,
}
