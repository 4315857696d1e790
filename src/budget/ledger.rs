//! Append-only charge ledger with an accept-or-reject proposal protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// One committed charge.
///
/// Entries are never removed; the running total is the sum over a
/// session's entries and `total_after_cents` snapshots it at commit time
/// for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub task_id: Uuid,
    pub amount_cents: u64,
    pub total_after_cents: u64,
    pub at: DateTime<Utc>,
}

/// Outcome of a charge proposal.
///
/// Expressed as a value rather than an error: a rejection is an expected
/// control-flow outcome for the proposing task, not an exceptional
/// condition inside the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeDecision {
    Accepted(BudgetEntry),
    Rejected {
        amount_cents: u64,
        remaining_cents: u64,
    },
}

impl ChargeDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<BudgetEntry>,
    committed_cents: u64,
}

/// Per-session budget ledger.
///
/// # Invariants
/// - `committed total <= cap` after every accepted proposal
/// - proposals are serialized: the mutex admits one at a time, so two
///   concurrent tasks can never both observe room for their charge
/// - a rejected proposal leaves the ledger untouched
pub struct BudgetLedger {
    cap_cents: u64,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    pub fn new(cap_cents: u64) -> Self {
        Self {
            cap_cents,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn cap_cents(&self) -> u64 {
        self.cap_cents
    }

    /// Propose a charge attributed to `task_id`.
    ///
    /// Accepts and appends an entry when the new running total stays
    /// within the cap; rejects without mutating state otherwise. The
    /// ledger never retries; a rejection is terminal for that task.
    pub async fn propose(&self, amount_cents: u64, task_id: Uuid) -> ChargeDecision {
        let mut state = self.state.lock().await;

        let attempted = state.committed_cents.saturating_add(amount_cents);
        if attempted > self.cap_cents {
            let remaining = self.cap_cents - state.committed_cents;
            tracing::warn!(
                task_id = %task_id,
                amount_cents,
                remaining_cents = remaining,
                cap_cents = self.cap_cents,
                "charge rejected"
            );
            return ChargeDecision::Rejected {
                amount_cents,
                remaining_cents: remaining,
            };
        }

        let entry = BudgetEntry {
            task_id,
            amount_cents,
            total_after_cents: attempted,
            at: Utc::now(),
        };
        state.committed_cents = attempted;
        state.entries.push(entry.clone());
        tracing::debug!(
            task_id = %task_id,
            amount_cents,
            total_cents = attempted,
            "charge accepted"
        );
        ChargeDecision::Accepted(entry)
    }

    /// Budget still available to future proposals.
    pub async fn remaining_cents(&self) -> u64 {
        self.cap_cents - self.state.lock().await.committed_cents
    }

    /// Sum of all committed charges.
    pub async fn total_committed_cents(&self) -> u64 {
        self.state.lock().await.committed_cents
    }

    /// Committed entries in commit order.
    pub async fn entries(&self) -> Vec<BudgetEntry> {
        self.state.lock().await.entries.clone()
    }
}
