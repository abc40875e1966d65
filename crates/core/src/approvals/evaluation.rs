use serde::{Deserialize, Serialize};

use crate::domain::rule::RuleDefinition;
use crate::ledger::{ApprovalLedger, Decision};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Approved,
    Rejected,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub status: EvaluationStatus,
    /// Every required approver has approved.
    pub satisfied_required: bool,
    pub approved_count: usize,
    pub total_count: usize,
    /// `floor(100 * approved_count / total_count)`.
    pub percentage: u8,
}

/// Aggregate approval state of a ledger under its rule.
///
/// A required rejection vetoes immediately. A pending required approver keeps
/// the expense pending whatever the percentage. Otherwise the expense is
/// approved once the floor percentage reaches the rule's minimum, and rejected
/// once every entry has decided without reaching it.
pub fn evaluate(rule: &RuleDefinition, ledger: &ApprovalLedger) -> EvaluationResult {
    debug_assert!(
        ledger.entries.iter().all(|entry| rule.approver(&entry.approver_id).is_some()),
        "ledger for `{}` references approvers missing from rule `{}`",
        ledger.expense_id,
        rule.id
    );

    let mut required_rejected = false;
    let mut required_pending = false;
    let mut approved_count = 0usize;

    for entry in &ledger.entries {
        let required = rule.is_required(&entry.approver_id);
        match entry.decision {
            Decision::Approved => approved_count += 1,
            Decision::Rejected => required_rejected |= required,
            Decision::Pending => required_pending |= required,
        }
    }

    let total_count = ledger.entries.len();
    let percentage = floor_percentage(approved_count, total_count);
    let satisfied_required = !required_rejected && !required_pending;

    let status = if required_rejected {
        EvaluationStatus::Rejected
    } else if required_pending {
        EvaluationStatus::Pending
    } else if i32::from(percentage) >= rule.min_approval_percentage {
        EvaluationStatus::Approved
    } else if ledger.is_complete() {
        EvaluationStatus::Rejected
    } else {
        EvaluationStatus::Pending
    };

    EvaluationResult { status, satisfied_required, approved_count, total_count, percentage }
}

fn floor_percentage(approved: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percentage = approved.saturating_mul(100) / total;
    u8::try_from(percentage.min(100)).unwrap_or(100)
}
