//! Opaque identifiers for the arena-keyed entity stores.
//!
//! Run / Tier / Phase reference each other by id, never by pointer, so the
//! Supervisor's stores stay flat, cheaply snapshot-able, and safe to hand
//! across the per-run worker boundary described in the concurrency model.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_newtype!(RunId, "run");
id_newtype!(TierId, "tier");
id_newtype!(PhaseId, "phase");
id_newtype!(ProjectId, "project");
id_newtype!(IssueKey, "issue");
id_newtype!(RuleId, "rule");
id_newtype!(HintId, "hint");

impl RunId {
    /// Generate a new run id: `{project_id}-{family_seed}-{uuid}`, so that
    /// `family()` (strip the trailing timestamp/uuid segment) round-trips.
    pub fn generate(project_id: &ProjectId, family: &str) -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(format!("{project_id}-{family}-{uuid}"))
    }

    /// The `family` is derived by stripping the trailing identifier segment
    /// from the run id, per the on-disk layout contract. The id's trailing
    /// segment is a full `uuid::Uuid` display form (36 chars, four internal
    /// hyphens) when generated via `generate`, so a plain "split on the last
    /// hyphen" would only strip the uuid's final group. Detect and strip the
    /// whole uuid tail first; fall back to the last-hyphen split for ids
    /// that don't end in one (e.g. hand-built test fixtures).
    pub fn family(&self) -> &str {
        const UUID_LEN: usize = 36;
        if self.0.len() > UUID_LEN + 1 {
            let tail_start = self.0.len() - UUID_LEN;
            if self.0.as_bytes()[tail_start - 1] == b'-' && uuid::Uuid::parse_str(&self.0[tail_start..]).is_ok() {
                return &self.0[..tail_start - 1];
            }
        }
        match self.0.rsplit_once('-') {
            Some((head, _tail)) => head,
            None => &self.0,
        }
    }

    /// The per-run integration branch name. Never `main`.
    pub fn integration_branch(&self) -> String {
        format!("autonomous/{}", self.0)
    }
}
