//! Budget module - spend tracking against a session cap.
//!
//! # Key Concepts
//! - Ledger: append-only charge records, one ledger per session
//! - Proposal: a charge is proposed and atomically accepted or rejected;
//!   a rejected proposal mutates nothing and is terminal for its task
//! - Serialization: at most one proposal commits at a time, so parallel
//!   tasks cannot race past the cap

mod ledger;

pub use ledger::{BudgetEntry, BudgetLedger, ChargeDecision};

/// Convert a dollar amount to the integer cents the ledger operates in.
///
/// Rounds to the nearest cent so a cap like `9.99` does not lose a cent
/// to float truncation.
pub fn usd_to_cents(usd: f64) -> u64 {
    (usd * 100.0).round().max(0.0) as u64
}

/// Render integer cents back as dollars for user-facing output.
pub fn cents_to_usd(cents: u64) -> f64 {
    cents as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_to_cents_rounds() {
        assert_eq!(usd_to_cents(10.0), 1000);
        assert_eq!(usd_to_cents(9.99), 999);
        assert_eq!(usd_to_cents(0.004), 0);
        assert_eq!(usd_to_cents(0.005), 1);
        assert_eq!(usd_to_cents(-1.0), 0);
    }
}
