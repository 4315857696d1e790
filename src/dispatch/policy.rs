//! Directive decomposition.
//!
//! Planning is deterministic, never model-driven: a directive either runs
//! whole under the primary profile, or its numbered steps become sub-agent
//! tasks that share the directive's preamble as context. Determinism here
//! is what makes transcripts reproducible.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dispatch::task::TaskSpec;
use crate::router::WorkerRole;

/// How the directive is split into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    /// One task, primary profile.
    Single,
    /// Numbered steps become sub-agent tasks.
    Staged,
    /// Staged when the directive contains two or more numbered steps,
    /// single otherwise.
    Auto,
}

impl Default for DelegationMode {
    fn default() -> Self {
        DelegationMode::Auto
    }
}

impl FromStr for DelegationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(DelegationMode::Single),
            "staged" => Ok(DelegationMode::Staged),
            "auto" => Ok(DelegationMode::Auto),
            other => Err(format!(
                "unknown delegation mode '{}' (expected single, staged, or auto)",
                other
            )),
        }
    }
}

impl std::fmt::Display for DelegationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegationMode::Single => write!(f, "single"),
            DelegationMode::Staged => write!(f, "staged"),
            DelegationMode::Auto => write!(f, "auto"),
        }
    }
}

/// An ordered set of tasks covering the whole directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    fn single(directive: &str) -> Self {
        Self {
            tasks: vec![TaskSpec::new(directive.trim(), WorkerRole::Primary)],
        }
    }

    fn staged(preamble: &str, steps: Vec<String>) -> Self {
        let tasks = steps
            .into_iter()
            .map(|step| {
                let goal = if preamble.is_empty() {
                    step
                } else {
                    format!("{}\n\nYour step:\n{}", preamble, step)
                };
                TaskSpec::new(goal, WorkerRole::SubAgent)
            })
            .collect();
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Produce the initial plan for a directive.
pub fn plan(directive: &str, mode: DelegationMode) -> Plan {
    match mode {
        DelegationMode::Single => Plan::single(directive),
        DelegationMode::Staged | DelegationMode::Auto => {
            let (preamble, steps) = extract_steps(directive);
            let threshold = if mode == DelegationMode::Staged { 1 } else { 2 };
            if steps.len() >= threshold {
                tracing::debug!(steps = steps.len(), mode = %mode, "directive split into staged tasks");
                Plan::staged(&preamble, steps)
            } else {
                tracing::debug!(mode = %mode, "no usable step structure, running directive whole");
                Plan::single(directive)
            }
        }
    }
}

/// Produce the recovery plan after a retryable failure: the directive is
/// coarsened back to a single primary task so one worker sees everything
/// the failed split saw.
pub fn replan(directive: &str) -> Plan {
    Plan::single(directive)
}

/// Split a directive into its preamble and numbered steps.
///
/// A step begins at a line like `1. ...` or `2) ...`; following unnumbered
/// lines belong to the step. Text before the first numbered line is the
/// shared preamble.
fn extract_steps(directive: &str) -> (String, Vec<String>) {
    let step_start = regex::Regex::new(r"^\s*\d+[.)]\s+(.*)$").expect("static pattern");

    let mut preamble_lines: Vec<&str> = Vec::new();
    let mut steps: Vec<String> = Vec::new();

    for line in directive.lines() {
        if let Some(caps) = step_start.captures(line) {
            steps.push(caps[1].trim_end().to_string());
        } else if let Some(current) = steps.last_mut() {
            current.push('\n');
            current.push_str(line.trim_end());
        } else {
            preamble_lines.push(line);
        }
    }

    let steps = steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (preamble_lines.join("\n").trim().to_string(), steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGED_DIRECTIVE: &str = "\
Build a small HTTP health checker.

1. Write the polling loop in src/poll.c
2. Add a Makefile that builds it with -Wall
   and links nothing beyond libc
3) Write a short README";

    #[test]
    fn test_auto_splits_numbered_directive() {
        let plan = plan(STAGED_DIRECTIVE, DelegationMode::Auto);
        assert_eq!(plan.len(), 3);
        for task in &plan.tasks {
            assert_eq!(task.role, WorkerRole::SubAgent);
            assert!(task.goal.contains("Build a small HTTP health checker."));
        }
        assert!(plan.tasks[1].goal.contains("links nothing beyond libc"));
    }

    #[test]
    fn test_auto_runs_prose_directive_whole() {
        let plan = plan("Summarize the attached design notes.", DelegationMode::Auto);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks[0].role, WorkerRole::Primary);
    }

    #[test]
    fn test_single_mode_ignores_structure() {
        let plan = plan(STAGED_DIRECTIVE, DelegationMode::Single);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks[0].role, WorkerRole::Primary);
    }

    #[test]
    fn test_staged_mode_without_steps_falls_back_to_single() {
        let plan = plan("Just do the thing.", DelegationMode::Staged);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks[0].role, WorkerRole::Primary);
    }

    #[test]
    fn test_staged_accepts_a_lone_numbered_step() {
        let plan = plan("Setup:\n1. Create the repo skeleton", DelegationMode::Staged);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks[0].role, WorkerRole::SubAgent);
    }

    #[test]
    fn test_replan_coarsens_to_primary() {
        let plan = replan(STAGED_DIRECTIVE);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks[0].role, WorkerRole::Primary);
    }

    #[test]
    fn test_mode_parses_from_cli_strings() {
        assert_eq!("staged".parse::<DelegationMode>().unwrap(), DelegationMode::Staged);
        assert_eq!(" Auto ".parse::<DelegationMode>().unwrap(), DelegationMode::Auto);
        assert!("whatever".parse::<DelegationMode>().is_err());
    }
}
