pub mod evaluation;
pub mod service;
pub mod store;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::rule::{ApproverId, RuleDefinition};

pub use evaluation::{evaluate, EvaluationResult, EvaluationStatus};
pub use service::{
    ApprovalService, ApprovalSettings, DecisionCommand, DecisionOutcome, QueueItem, Submission,
};
pub use store::{ApprovalStore, InMemoryApprovalStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("rule has no approvers and the manager is not an approver")]
    EmptyApproverSet,
    #[error("minimum approval percentage {value} is outside 0..=100")]
    InvalidPercentage { value: i32 },
    #[error("minimum approval percentage `{raw}` is not a whole number")]
    UnparseablePercentage { raw: String },
    #[error("approver `{approver_id}` appears more than once")]
    DuplicateApprover { approver_id: ApproverId },
    #[error("manager is flagged as an approver but no manager is set")]
    MissingManager,
}

/// Checks a rule for internal consistency. Pure; the first failing check wins.
///
/// Approver ids are compared exactly, the same way ledger entries are matched.
pub fn validate(rule: &RuleDefinition) -> Result<(), ValidationError> {
    if rule.approvers.is_empty() && !rule.manager_is_approver {
        return Err(ValidationError::EmptyApproverSet);
    }

    if !(0..=100).contains(&rule.min_approval_percentage) {
        return Err(ValidationError::InvalidPercentage { value: rule.min_approval_percentage });
    }

    let mut seen = HashSet::new();
    for approver in rule.effective_approvers() {
        if !seen.insert(&approver.id) {
            return Err(ValidationError::DuplicateApprover { approver_id: approver.id.clone() });
        }
    }

    if rule.manager_is_approver && rule.manager.is_none() {
        return Err(ValidationError::MissingManager);
    }

    Ok(())
}
