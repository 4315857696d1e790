//! Sessions: one directive, one budget, one output root.
//!
//! A [`SessionRequest`] is what a caller asks for. Validating it and
//! hashing its identifying parts produces a [`Session`], whose identity
//! keys the transcript so that the same directive, output name, and tier
//! always map to the same recording.
//!
//! # States
//! A session moves `Initializing → Dispatching → Awaiting → Finalizing`
//! and ends in exactly one of `Completed`, `Aborted`, or `Replayed`.
//! Terminal states are never left.

pub mod controller;

pub use controller::SessionController;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::budget::usd_to_cents;
use crate::dispatch::DelegationMode;
use crate::error::{Result, RunnerError};
use crate::transcript::AbortReason;

/// What a caller asks the runner to do.
///
/// Wire names follow the invocation scripts' keywords (`into`, `model`,
/// `replay_e2e`), so request documents and recorded transcripts read
/// like the call that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// The work to perform, verbatim.
    pub directive: String,
    /// Directory name (one path component) the artifacts land under.
    #[serde(rename = "into")]
    pub output_name: String,
    /// Tier name resolved through the model router.
    #[serde(rename = "model")]
    pub tier: String,
    /// Spending cap in dollars. Converted to cents once, up front.
    pub limit_usd: f64,
    /// Reproduce a prior recording instead of spending anything.
    #[serde(default, alias = "replay_e2e")]
    pub replay: bool,
    #[serde(default)]
    pub delegation: DelegationMode,
    /// Allow replacing an output root whose content differs.
    #[serde(default)]
    pub overwrite: bool,
}

impl SessionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.directive.trim().is_empty() {
            return Err(RunnerError::invalid_request("directive must not be empty"));
        }
        if self.output_name.trim().is_empty() {
            return Err(RunnerError::invalid_request("output name must not be empty"));
        }
        if self.output_name.contains(['/', '\\'])
            || self.output_name == "."
            || self.output_name == ".."
        {
            return Err(RunnerError::invalid_request(format!(
                "output name '{}' must be a plain directory name",
                self.output_name
            )));
        }
        if !self.limit_usd.is_finite() || self.limit_usd <= 0.0 {
            return Err(RunnerError::invalid_request("budget limit must be a positive dollar amount"));
        }
        if self.tier.trim().is_empty() {
            return Err(RunnerError::invalid_request("tier must not be empty"));
        }
        Ok(())
    }

    /// Stable identity: hash of the directive, output name, and tier.
    ///
    /// Everything else (budget, flags) can vary between invocations
    /// without changing which transcript the session belongs to.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.directive.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.output_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.tier.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn cap_cents(&self) -> u64 {
        usd_to_cents(self.limit_usd)
    }
}

/// Lifecycle states. See the module docs for the allowed walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Dispatching,
    Awaiting,
    Finalizing,
    Completed,
    Aborted,
    Replayed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Replayed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Dispatching => "dispatching",
            SessionState::Awaiting => "awaiting",
            SessionState::Finalizing => "finalizing",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Replayed => "replayed",
        };
        write!(f, "{name}")
    }
}

/// A validated, identified run of one request.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub identity: String,
    pub request: SessionRequest,
    pub state: SessionState,
}

impl Session {
    pub fn new(request: SessionRequest) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            identity: request.identity(),
            request,
            state: SessionState::Initializing,
        })
    }

    pub fn transition(&mut self, next: SessionState) {
        tracing::info!(
            session_id = %self.id,
            from = %self.state,
            to = %next,
            "session state change"
        );
        self.state = next;
    }

    /// Where artifacts land: `<output_name>` under the configured outputs
    /// directory.
    pub fn output_root(&self, outputs_dir: &std::path::Path) -> PathBuf {
        outputs_dir.join(&self.request.output_name)
    }
}

/// Why a session ended without completing.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortInfo {
    pub reason: AbortReason,
    pub message: String,
}

/// What the caller gets back for a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub identity: String,
    pub state: SessionState,
    /// The session cap, kept alongside the total so callers can report
    /// how much headroom was left.
    pub cap_cents: u64,
    pub total_cost_cents: u64,
    pub output_root: PathBuf,
    /// Paths written under the output root, relative to it.
    pub written: Vec<PathBuf>,
    pub transcript: PathBuf,
    /// Present when this session aborted, or when a replayed recording
    /// had aborted.
    pub abort: Option<AbortInfo>,
}

impl SessionReport {
    /// Process exit code mirroring the outcome: success (including a
    /// successful replay of a completed recording) is 0, an aborted
    /// outcome is 3.
    pub fn exit_code(&self) -> i32 {
        if self.abort.is_some() {
            3
        } else {
            0
        }
    }

    /// Budget left under the cap when the session ended.
    pub fn remaining_cents(&self) -> u64 {
        self.cap_cents.saturating_sub(self.total_cost_cents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;

    fn request() -> SessionRequest {
        SessionRequest {
            directive: "build a grep clone".to_string(),
            output_name: "jitgrep".to_string(),
            tier: "pro".to_string(),
            limit_usd: 10.0,
            replay: false,
            delegation: DelegationMode::Auto,
            overwrite: false,
        }
    }

    #[test]
    fn test_empty_directive_is_invalid() {
        let mut req = request();
        req.directive = "   \n".to_string();
        let err = req.validate().unwrap_err();
        assert!(matches!(err, RunnerError::InvalidRequest(_)));
    }

    #[test]
    fn test_non_positive_budget_is_invalid() {
        for bad in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            let mut req = request();
            req.limit_usd = bad;
            assert!(
                matches!(req.validate().unwrap_err(), RunnerError::InvalidRequest(_)),
                "limit {bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_output_name_must_be_one_component() {
        let mut req = request();
        req.output_name = "a/b".to_string();
        assert!(req.validate().is_err());
        req.output_name = "..".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_identity_depends_only_on_identifying_fields() {
        let base = request();
        let mut same = request();
        same.limit_usd = 99.0;
        same.replay = true;
        same.overwrite = true;
        assert_eq!(base.identity(), same.identity());

        let mut other = request();
        other.tier = "fast".to_string();
        assert_ne!(base.identity(), other.identity());

        let mut renamed = request();
        renamed.output_name = "grepjit".to_string();
        assert_ne!(base.identity(), renamed.identity());
    }

    #[test]
    fn test_cap_conversion_rounds_to_cents() {
        let mut req = request();
        req.limit_usd = 10.0;
        assert_eq!(req.cap_cents(), 1000);
        req.limit_usd = 0.015;
        assert_eq!(req.cap_cents(), 2);
    }

    #[test]
    fn test_wire_names_match_the_invocation_keywords() {
        let value = serde_json::to_value(request()).unwrap();
        assert!(value.get("into").is_some());
        assert!(value.get("model").is_some());
        assert!(value.get("output_name").is_none());
        assert!(value.get("tier").is_none());

        let parsed: SessionRequest = serde_json::from_str(
            r#"{"directive":"build","into":"site","model":"pro","limit_usd":0.5,"replay_e2e":true}"#,
        )
        .unwrap();
        assert_eq!(parsed.output_name, "site");
        assert_eq!(parsed.tier, "pro");
        assert!(parsed.replay);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
        assert!(SessionState::Replayed.is_terminal());
        assert!(!SessionState::Awaiting.is_terminal());
    }
}
