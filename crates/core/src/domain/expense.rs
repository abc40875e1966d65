use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::rule::RuleId;
use crate::flows::{ExpenseEvent, ExpenseTransitionError, TransitionOutcome};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl std::fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpenseStatus {
    Draft,
    WaitingApproval,
    Approved,
    Rejected,
    Cancelled,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::WaitingApproval => "waiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "draft" => Some(Self::Draft),
            "waiting_approval" | "waitingapproval" => Some(Self::WaitingApproval),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: ExpenseId,
    pub employee_id: String,
    pub description: String,
    pub category: Option<String>,
    pub expense_date: Option<NaiveDate>,
    pub paid_by: Option<String>,
    pub remarks: Option<String>,
    pub amount: Decimal,
    pub currency_code: String,
    pub status: ExpenseStatus,
    pub rule_id: Option<RuleId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    /// A fresh draft expense as produced by the employee submission screen.
    pub fn draft(
        id: impl Into<String>,
        employee_id: impl Into<String>,
        description: impl Into<String>,
        amount: Decimal,
        currency_code: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ExpenseId(id.into()),
            employee_id: employee_id.into(),
            description: description.into(),
            category: None,
            expense_date: None,
            paid_by: None,
            remarks: None,
            amount,
            currency_code: currency_code.into(),
            status: ExpenseStatus::Draft,
            rule_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(
        &mut self,
        event: ExpenseEvent,
    ) -> Result<TransitionOutcome, ExpenseTransitionError> {
        let outcome = crate::flows::transition(self.status, event)?;
        self.status = outcome.to;
        self.updated_at = Utc::now();
        Ok(outcome)
    }
}
