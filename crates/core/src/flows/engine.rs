use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome};
use crate::domain::expense::ExpenseStatus;
use crate::flows::states::{ExpenseAction, ExpenseEvent, TransitionOutcome};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExpenseTransitionError {
    #[error("invalid expense transition from {state:?} using event {event:?}")]
    InvalidTransition { state: ExpenseStatus, event: ExpenseEvent },
    #[error("expense in {state:?} can no longer be edited")]
    NotEditable { state: ExpenseStatus },
}

pub fn transition(
    current: ExpenseStatus,
    event: ExpenseEvent,
) -> Result<TransitionOutcome, ExpenseTransitionError> {
    use ExpenseAction::{CloseLedger, NotifyApprovers, NotifySubmitter, SeedLedger};
    use ExpenseEvent::{ApprovalDenied, ApprovalGranted, CancelRequested, Submitted};
    use ExpenseStatus::{Approved, Cancelled, Draft, Rejected, WaitingApproval};

    let (to, actions) = match (current, event) {
        (Draft, Submitted) => (WaitingApproval, vec![SeedLedger, NotifyApprovers]),
        (WaitingApproval, ApprovalGranted) => (Approved, vec![CloseLedger, NotifySubmitter]),
        (WaitingApproval, ApprovalDenied) => (Rejected, vec![CloseLedger, NotifySubmitter]),
        (Draft, CancelRequested) => (Cancelled, Vec::new()),
        (WaitingApproval, CancelRequested) => (Cancelled, vec![CloseLedger, NotifyApprovers]),
        _ => return Err(ExpenseTransitionError::InvalidTransition { state: current, event }),
    };

    Ok(TransitionOutcome { from: current, to, event, actions })
}

/// Audit record for a transition that has been persisted.
pub fn applied_transition_event(
    context: &AuditContext,
    outcome: &TransitionOutcome,
) -> AuditEvent {
    AuditEvent::from_context(
        context,
        "expense.transition_applied",
        AuditCategory::Lifecycle,
        AuditOutcome::Success,
    )
    .with_metadata("from", outcome.from.as_str())
    .with_metadata("to", outcome.to.as_str())
    .with_metadata("event", format!("{:?}", outcome.event))
}

pub fn rejected_transition_event(
    context: &AuditContext,
    error: &ExpenseTransitionError,
) -> AuditEvent {
    AuditEvent::from_context(
        context,
        "expense.transition_rejected",
        AuditCategory::Lifecycle,
        AuditOutcome::Rejected,
    )
    .with_metadata("error", error.to_string())
}
