//! Run lifecycle types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, TestId};

/// Metadata key under which every run mirrors its session key.
pub const METADATA_SESSION_KEY: &str = "session_key";
/// Metadata key for the user prompt that triggered the run.
pub const METADATA_PROMPT: &str = "prompt";

/// Lifecycle state of a run. Monotone: once a run leaves `Running` it
/// never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Error,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One execution of the browser agent against one session, the unit of
/// status tracking. At most one `Running` run may exist per session key
/// at any time; the store enforces that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    /// Address of the physical resource (e.g. the live browser
    /// instance) this run is bound to.
    pub session_key: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, on the first transition out of `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<TestId>,
}

impl Run {
    /// Create a new running run with the current timestamp. Metadata is
    /// seeded with the session key and the triggering prompt.
    pub fn new(
        session_key: impl Into<String>,
        prompt: impl Into<String>,
        test_id: Option<TestId>,
    ) -> Self {
        let session_key = session_key.into();
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_SESSION_KEY.to_owned(), session_key.clone());
        metadata.insert(METADATA_PROMPT.to_owned(), prompt.into());

        Self {
            run_id: RunId::default(),
            session_key,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            metadata,
            test_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_running_with_seeded_metadata() {
        let run = Run::new("browser-7", "check the login form", None);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert_eq!(
            run.metadata.get(METADATA_SESSION_KEY).map(String::as_str),
            Some("browser-7")
        );
        assert_eq!(
            run.metadata.get(METADATA_PROMPT).map(String::as_str),
            Some("check the login form")
        );
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        for status in [
            RunStatus::Passed,
            RunStatus::Failed,
            RunStatus::Error,
            RunStatus::Canceled,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn run_serde_roundtrip() {
        let run = Run::new("browser-7", "smoke", Some(TestId::from_string("T1")));
        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.session_key, "browser-7");
        assert_eq!(back.test_id, Some(TestId::from_string("T1")));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Canceled).unwrap(),
            "\"canceled\""
        );
    }
}
