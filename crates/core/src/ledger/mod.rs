use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::expense::ExpenseId;
use crate::domain::rule::{ApproverId, RuleDefinition, RuleId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A decision an approver can submit. Pending is not a verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl From<Verdict> for Decision {
    fn from(value: Verdict) -> Self {
        match value {
            Verdict::Approved => Self::Approved,
            Verdict::Rejected => Self::Rejected,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub approver_id: ApproverId,
    pub decision: Decision,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    fn pending(approver_id: ApproverId) -> Self {
        Self { approver_id, decision: Decision::Pending, timestamp: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalLedger {
    pub expense_id: ExpenseId,
    pub rule_id: RuleId,
    pub rule_revision: u32,
    #[serde(default)]
    pub version: u32,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerError {
    #[error("approver `{approver_id}` has no entry in this ledger")]
    UnknownApprover { approver_id: ApproverId },
    #[error("approver `{approver_id}` already decided ({decision:?})")]
    AlreadyDecided { approver_id: ApproverId, decision: Decision },
    #[error("approver `{approver_id}` must wait for `{waiting_on}` to decide first")]
    OutOfOrder { approver_id: ApproverId, waiting_on: ApproverId },
    #[error(
        "ledger was seeded from rule `{ledger_rule}` revision {ledger_revision}, got `{rule}` revision {revision}"
    )]
    RuleMismatch { ledger_rule: RuleId, ledger_revision: u32, rule: RuleId, revision: u32 },
}

impl ApprovalLedger {
    /// Seeds one pending entry per approver. The manager, when it approves,
    /// is always the first entry.
    pub fn create(rule: &RuleDefinition, expense_id: ExpenseId) -> Self {
        Self {
            expense_id,
            rule_id: rule.id.clone(),
            rule_revision: rule.revision,
            version: 0,
            entries: rule
                .effective_approvers()
                .map(|approver| LedgerEntry::pending(approver.id.clone()))
                .collect(),
        }
    }

    pub fn entry(&self, approver_id: &ApproverId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|entry| &entry.approver_id == approver_id)
    }

    pub fn is_seeded_from(&self, rule: &RuleDefinition) -> bool {
        self.rule_id == rule.id && self.rule_revision == rule.revision
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|entry| entry.decision.is_terminal())
    }

    pub fn record_decision(
        &self,
        rule: &RuleDefinition,
        approver_id: &ApproverId,
        verdict: Verdict,
    ) -> Result<Self, LedgerError> {
        self.record_decision_at(rule, approver_id, verdict, Utc::now())
    }

    /// Returns a new ledger with the decision applied; `self` is untouched.
    pub fn record_decision_at(
        &self,
        rule: &RuleDefinition,
        approver_id: &ApproverId,
        verdict: Verdict,
        decided_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        if !self.is_seeded_from(rule) {
            return Err(LedgerError::RuleMismatch {
                ledger_rule: self.rule_id.clone(),
                ledger_revision: self.rule_revision,
                rule: rule.id.clone(),
                revision: rule.revision,
            });
        }

        let Some(position) =
            self.entries.iter().position(|entry| &entry.approver_id == approver_id)
        else {
            return Err(LedgerError::UnknownApprover { approver_id: approver_id.clone() });
        };

        let entry = &self.entries[position];
        if entry.decision.is_terminal() {
            return Err(LedgerError::AlreadyDecided {
                approver_id: approver_id.clone(),
                decision: entry.decision,
            });
        }

        if rule.sequential {
            if let Some(earlier) =
                self.entries[..position].iter().find(|entry| !entry.decision.is_terminal())
            {
                return Err(LedgerError::OutOfOrder {
                    approver_id: approver_id.clone(),
                    waiting_on: earlier.approver_id.clone(),
                });
            }
        }

        let mut next = self.clone();
        next.entries[position].decision = verdict.into();
        next.entries[position].timestamp = Some(decided_at);
        next.version = next.version.saturating_add(1);
        Ok(next)
    }

    /// Approvers who may decide right now. In sequential mode that is at most
    /// the first pending entry.
    pub fn actionable_approvers(&self, rule: &RuleDefinition) -> Vec<ApproverId> {
        let pending = self.entries.iter().filter(|entry| !entry.decision.is_terminal());
        if rule.sequential {
            pending.take(1).map(|entry| entry.approver_id.clone()).collect()
        } else {
            pending.map(|entry| entry.approver_id.clone()).collect()
        }
    }
}

pub fn create_ledger(rule: &RuleDefinition, expense_id: ExpenseId) -> ApprovalLedger {
    ApprovalLedger::create(rule, expense_id)
}

pub fn record_decision(
    ledger: &ApprovalLedger,
    rule: &RuleDefinition,
    approver_id: &ApproverId,
    verdict: Verdict,
) -> Result<ApprovalLedger, LedgerError> {
    ledger.record_decision(rule, approver_id, verdict)
}
