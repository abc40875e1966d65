use serde::{Deserialize, Serialize};

use crate::domain::expense::ExpenseStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseEvent {
    Submitted,
    ApprovalGranted,
    ApprovalDenied,
    CancelRequested,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseAction {
    SeedLedger,
    NotifyApprovers,
    NotifySubmitter,
    CloseLedger,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ExpenseStatus,
    pub to: ExpenseStatus,
    pub event: ExpenseEvent,
    pub actions: Vec<ExpenseAction>,
}
