//! Model routing: abstract capability requests to concrete worker profiles.
//!
//! The router is a pure lookup over the static tier table. It performs no
//! IO and holds no mutable state, which is what lets the replay engine
//! reproduce routing decisions without consulting it at all: every selected
//! profile is recorded in the transcript at dispatch time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{RunnerConfig, TierConfig};
use crate::error::{Result, RunnerError};

/// Capability a session asks the router to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// The worker driving the overall directive.
    Primary,
    /// A worker taking a delegated slice of the directive.
    SubAgent,
}

/// Concrete worker selection for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Tier the profile was resolved from.
    pub tier: String,
    /// Provider model identifier handed to the worker.
    pub model: String,
    /// Worker command line; `None` selects the built-in deterministic worker.
    pub command: Option<Vec<String>>,
    /// Charge applied when the worker reports no cost of its own.
    pub flat_cost_cents: u64,
}

impl WorkerProfile {
    fn from_tier(name: &str, tier: &TierConfig) -> Self {
        Self {
            tier: name.to_string(),
            model: tier.model.clone(),
            command: tier.command.clone(),
            flat_cost_cents: tier.flat_cost_cents,
        }
    }
}

/// Maps capability requests to worker profiles using static configuration.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    tiers: HashMap<String, TierConfig>,
}

impl ModelRouter {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            tiers: config.tiers.clone(),
        }
    }

    /// Check whether a tier symbol is configured.
    pub fn knows(&self, tier: &str) -> bool {
        self.tiers.contains_key(tier)
    }

    /// Resolve a tier for the given role.
    ///
    /// `SubAgent` follows the tier's configured delegate; a tier with no
    /// delegate serves both roles itself. Fails with `UnknownTier` for
    /// unconfigured symbols, including a dangling delegate.
    pub fn select(&self, tier: &str, role: WorkerRole) -> Result<WorkerProfile> {
        let entry = self
            .tiers
            .get(tier)
            .ok_or_else(|| RunnerError::UnknownTier(tier.to_string()))?;

        match role {
            WorkerRole::Primary => Ok(WorkerProfile::from_tier(tier, entry)),
            WorkerRole::SubAgent => {
                let delegate = entry.subagent.as_deref().unwrap_or(tier);
                let sub = self
                    .tiers
                    .get(delegate)
                    .ok_or_else(|| RunnerError::UnknownTier(delegate.to_string()))?;
                Ok(WorkerProfile::from_tier(delegate, sub))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ModelRouter {
        ModelRouter::new(&RunnerConfig::default())
    }

    #[test]
    fn test_select_primary() {
        let profile = router().select("pro", WorkerRole::Primary).unwrap();
        assert_eq!(profile.tier, "pro");
        assert_eq!(profile.model, "anthropic/claude-sonnet-4.5");
    }

    #[test]
    fn test_subagent_follows_delegate() {
        let profile = router().select("pro", WorkerRole::SubAgent).unwrap();
        assert_eq!(profile.tier, "fast");
    }

    #[test]
    fn test_subagent_without_delegate_uses_own_tier() {
        let profile = router().select("fast", WorkerRole::SubAgent).unwrap();
        assert_eq!(profile.tier, "fast");
    }

    #[test]
    fn test_unknown_tier() {
        let err = router().select("ultra", WorkerRole::Primary).unwrap_err();
        assert!(matches!(err, RunnerError::UnknownTier(t) if t == "ultra"));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let r = router();
        let a = r.select("pro", WorkerRole::Primary).unwrap();
        let b = r.select("pro", WorkerRole::Primary).unwrap();
        assert_eq!(a, b);
    }
}
