pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod ledger;

pub use approvals::{
    evaluate, validate, ApprovalService, ApprovalSettings, ApprovalStore, DecisionCommand,
    DecisionOutcome, EvaluationResult, EvaluationStatus, InMemoryApprovalStore, QueueItem,
    StoreError, Submission, ValidationError,
};
pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use domain::expense::{Expense, ExpenseId, ExpenseStatus};
pub use domain::rule::{Approver, ApproverId, RuleDefinition, RuleDraft, RuleId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{ApprovalLedger, Decision, LedgerEntry, LedgerError, Verdict};
