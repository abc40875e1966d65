use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use crate::domain::rule::{RuleDefinition, RuleId};
use crate::ledger::ApprovalLedger;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("ledger for expense `{expense_id}` moved from version {expected} to {found}")]
    VersionConflict { expense_id: ExpenseId, expected: u32, found: u32 },
    #[error("expense `{expense_id}` already has a ledger")]
    LedgerExists { expense_id: ExpenseId },
    #[error("rule `{rule_id}` revision {revision} already exists")]
    RevisionExists { rule_id: RuleId, revision: u32 },
    #[error("expense `{0}` does not exist")]
    MissingExpense(ExpenseId),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Persistence collaborator for rules, expenses and their ledgers.
///
/// Implementations must give read-your-writes consistency and must apply
/// `commit_decision` only when the stored ledger version equals
/// `expected_version`.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert_rule(&self, rule: &RuleDefinition) -> Result<(), StoreError>;
    async fn latest_rule(&self, id: &RuleId) -> Result<Option<RuleDefinition>, StoreError>;
    async fn rule_revision(
        &self,
        id: &RuleId,
        revision: u32,
    ) -> Result<Option<RuleDefinition>, StoreError>;

    async fn save_expense(&self, expense: &Expense) -> Result<(), StoreError>;
    async fn find_expense(&self, id: &ExpenseId) -> Result<Option<Expense>, StoreError>;
    async fn expenses_for_employee(&self, employee_id: &str) -> Result<Vec<Expense>, StoreError>;

    async fn find_ledger(&self, expense_id: &ExpenseId)
        -> Result<Option<ApprovalLedger>, StoreError>;
    /// Ledgers whose expense is still waiting for approval.
    async fn open_ledgers(&self) -> Result<Vec<ApprovalLedger>, StoreError>;

    /// Stores a freshly seeded ledger together with the submitted expense.
    async fn commit_submission(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
    ) -> Result<(), StoreError>;

    /// Stores a decided ledger and the expense status it produced.
    async fn commit_decision(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
        expected_version: u32,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct StoreState {
    rules: BTreeMap<(RuleId, u32), RuleDefinition>,
    expenses: HashMap<ExpenseId, Expense>,
    ledgers: HashMap<ExpenseId, ApprovalLedger>,
}

/// Mutex-guarded store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    state: Mutex<StoreState>,
}

impl InMemoryApprovalStore {
    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut *state),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn insert_rule(&self, rule: &RuleDefinition) -> Result<(), StoreError> {
        self.with_state(|state| {
            let key = (rule.id.clone(), rule.revision);
            if state.rules.contains_key(&key) {
                return Err(StoreError::RevisionExists {
                    rule_id: rule.id.clone(),
                    revision: rule.revision,
                });
            }
            state.rules.insert(key, rule.clone());
            Ok(())
        })
    }

    async fn latest_rule(&self, id: &RuleId) -> Result<Option<RuleDefinition>, StoreError> {
        Ok(self.with_state(|state| {
            state
                .rules
                .range((id.clone(), 0)..=(id.clone(), u32::MAX))
                .next_back()
                .map(|(_, rule)| rule.clone())
        }))
    }

    async fn rule_revision(
        &self,
        id: &RuleId,
        revision: u32,
    ) -> Result<Option<RuleDefinition>, StoreError> {
        Ok(self.with_state(|state| state.rules.get(&(id.clone(), revision)).cloned()))
    }

    async fn save_expense(&self, expense: &Expense) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.expenses.insert(expense.id.clone(), expense.clone());
        });
        Ok(())
    }

    async fn find_expense(&self, id: &ExpenseId) -> Result<Option<Expense>, StoreError> {
        Ok(self.with_state(|state| state.expenses.get(id).cloned()))
    }

    async fn expenses_for_employee(&self, employee_id: &str) -> Result<Vec<Expense>, StoreError> {
        let mut expenses = self.with_state(|state| {
            state
                .expenses
                .values()
                .filter(|expense| expense.employee_id == employee_id)
                .cloned()
                .collect::<Vec<_>>()
        });
        expenses.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(expenses)
    }

    async fn find_ledger(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Option<ApprovalLedger>, StoreError> {
        Ok(self.with_state(|state| state.ledgers.get(expense_id).cloned()))
    }

    async fn open_ledgers(&self) -> Result<Vec<ApprovalLedger>, StoreError> {
        let mut ledgers = self.with_state(|state| {
            state
                .ledgers
                .values()
                .filter(|ledger| {
                    state
                        .expenses
                        .get(&ledger.expense_id)
                        .is_some_and(|expense| expense.status == ExpenseStatus::WaitingApproval)
                })
                .cloned()
                .collect::<Vec<_>>()
        });
        ledgers.sort_by(|left, right| left.expense_id.cmp(&right.expense_id));
        Ok(ledgers)
    }

    async fn commit_submission(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
    ) -> Result<(), StoreError> {
        self.with_state(|state| {
            if state.ledgers.contains_key(&ledger.expense_id) {
                return Err(StoreError::LedgerExists { expense_id: ledger.expense_id.clone() });
            }
            state.expenses.insert(expense.id.clone(), expense.clone());
            state.ledgers.insert(ledger.expense_id.clone(), ledger.clone());
            Ok(())
        })
    }

    async fn commit_decision(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        self.with_state(|state| {
            let found = state
                .ledgers
                .get(&ledger.expense_id)
                .map(|stored| stored.version)
                .ok_or_else(|| StoreError::MissingExpense(ledger.expense_id.clone()))?;
            if found != expected_version {
                return Err(StoreError::VersionConflict {
                    expense_id: ledger.expense_id.clone(),
                    expected: expected_version,
                    found,
                });
            }
            state.expenses.insert(expense.id.clone(), expense.clone());
            state.ledgers.insert(ledger.expense_id.clone(), ledger.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{ApprovalStore, InMemoryApprovalStore, StoreError};
    use crate::domain::expense::{Expense, ExpenseStatus};
    use crate::domain::rule::{Approver, ApproverId, RuleDefinition, RuleId};
    use crate::ledger::{ApprovalLedger, Verdict};

    fn rule() -> RuleDefinition {
        RuleDefinition::builder("rule-1")
            .approver(Approver::new("a", "Sarah Johnson", false))
            .build()
            .expect("valid rule")
    }

    #[tokio::test]
    async fn latest_rule_returns_highest_revision() {
        let store = InMemoryApprovalStore::default();
        store.insert_rule(&rule()).await.expect("rev 1");
        store.insert_rule(&rule().with_revision(2)).await.expect("rev 2");
        store
            .insert_rule(
                &RuleDefinition::builder("rule-2")
                    .approver(Approver::new("b", "Michael Chen", false))
                    .build()
                    .expect("valid rule")
                    .with_revision(7),
            )
            .await
            .expect("other rule");

        let latest = store.latest_rule(&RuleId("rule-1".to_string())).await.expect("query");
        assert_eq!(latest.map(|rule| rule.revision), Some(2));
        assert!(store
            .rule_revision(&RuleId("rule-1".to_string()), 1)
            .await
            .expect("query")
            .is_some());
    }

    #[tokio::test]
    async fn stored_revisions_are_immutable() {
        let store = InMemoryApprovalStore::default();
        store.insert_rule(&rule()).await.expect("rev 1");

        let error = store.insert_rule(&rule()).await.expect_err("duplicate revision");
        assert!(matches!(error, StoreError::RevisionExists { revision: 1, .. }));
    }

    #[tokio::test]
    async fn commit_decision_rejects_stale_version() {
        let store = InMemoryApprovalStore::default();
        let rule = rule();
        let mut expense =
            Expense::draft("EXP-1", "emp-1", "Taxi", Decimal::new(1_200, 2), "USD");
        expense.status = ExpenseStatus::WaitingApproval;
        let ledger = ApprovalLedger::create(&rule, expense.id.clone());
        store.commit_submission(&expense, &ledger).await.expect("submission");

        let decided = ledger
            .record_decision(&rule, &ApproverId("a".to_string()), Verdict::Approved)
            .expect("decision");
        store.commit_decision(&expense, &decided, 0).await.expect("first commit");

        let error =
            store.commit_decision(&expense, &decided, 0).await.expect_err("stale version");
        assert!(matches!(error, StoreError::VersionConflict { expected: 0, found: 1, .. }));
    }
}
