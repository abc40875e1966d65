use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use outlay_core::approvals::{ApprovalStore, StoreError};
use outlay_core::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use outlay_core::domain::rule::{Approver, ApproverId, RuleDefinition, RuleId};
use outlay_core::ledger::{ApprovalLedger, Decision, LedgerEntry};

use super::RepositoryError;
use crate::DbPool;

const RULE_COLUMNS: &str = "id, revision, description, applies_to, manager_json,
                            manager_is_approver, sequential, min_approval_percentage,
                            approvers_json";

const EXPENSE_COLUMNS: &str = "id, employee_id, description, category, expense_date, paid_by,
                               remarks, amount, currency_code, status, rule_id, created_at,
                               updated_at";

/// SQLite-backed [`ApprovalStore`]. Decisions commit through a conditional
/// `UPDATE ... WHERE version = ?` so concurrent writers on one ledger
/// serialize.
pub struct SqlApprovalStore {
    pool: DbPool,
}

impl SqlApprovalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn insert_rule_row(&self, rule: &RuleDefinition) -> Result<(), RepositoryError> {
        let manager_json = rule
            .manager
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| RepositoryError::Decode(format!("encode manager: {error}")))?;
        let approvers_json = serde_json::to_string(&rule.approvers)
            .map_err(|error| RepositoryError::Decode(format!("encode approvers: {error}")))?;

        let inserted = sqlx::query(
            "INSERT INTO approval_rule (id, revision, description, applies_to, manager_json,
                                        manager_is_approver, sequential,
                                        min_approval_percentage, approvers_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id.0)
        .bind(i64::from(rule.revision))
        .bind(&rule.description)
        .bind(&rule.applies_to)
        .bind(&manager_json)
        .bind(rule.manager_is_approver)
        .bind(rule.sequential)
        .bind(rule.min_approval_percentage)
        .bind(&approvers_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(RepositoryError::Store(StoreError::RevisionExists {
                    rule_id: rule.id.clone(),
                    revision: rule.revision,
                }))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn latest_rule_row(&self, id: &RuleId) -> Result<Option<RuleDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rule WHERE id = ? ORDER BY revision DESC LIMIT 1"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn rule_revision_row(
        &self,
        id: &RuleId,
        revision: u32,
    ) -> Result<Option<RuleDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rule WHERE id = ? AND revision = ?"
        ))
        .bind(&id.0)
        .bind(i64::from(revision))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn find_expense_row(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expense WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(expense_from_row).transpose()
    }

    async fn expense_rows_for_employee(
        &self,
        employee_id: &str,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expense
             WHERE employee_id = ?
             ORDER BY created_at DESC, id ASC"
        ))
        .bind(employee_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(expense_from_row).collect()
    }

    async fn save_expense_row(&self, expense: &Expense) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        upsert_expense(&mut conn, expense).await
    }

    async fn find_ledger_row(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Option<ApprovalLedger>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT expense_id, rule_id, rule_revision, version
             FROM approval_ledger WHERE expense_id = ?",
        )
        .bind(&expense_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(ref row) => Ok(Some(ledger_with_entries(&mut conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn open_ledger_rows(&self) -> Result<Vec<ApprovalLedger>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT l.expense_id, l.rule_id, l.rule_revision, l.version
             FROM approval_ledger l
             JOIN expense e ON e.id = l.expense_id
             WHERE e.status = ?
             ORDER BY l.expense_id ASC",
        )
        .bind(ExpenseStatus::WaitingApproval.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut ledgers = Vec::with_capacity(rows.len());
        for row in &rows {
            ledgers.push(ledger_with_entries(&mut conn, row).await?);
        }
        Ok(ledgers)
    }

    async fn commit_submission_rows(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        upsert_expense(&mut tx, expense).await?;

        let inserted = sqlx::query(
            "INSERT INTO approval_ledger (expense_id, rule_id, rule_revision, version)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&ledger.expense_id.0)
        .bind(&ledger.rule_id.0)
        .bind(i64::from(ledger.rule_revision))
        .bind(i64::from(ledger.version))
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                return Err(RepositoryError::Store(StoreError::LedgerExists {
                    expense_id: ledger.expense_id.clone(),
                }));
            }
            Err(error) => return Err(error.into()),
        }

        for (position, entry) in ledger.entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO ledger_entry (expense_id, position, approver_id, decision, decided_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&ledger.expense_id.0)
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(&entry.approver_id.0)
            .bind(entry.decision.as_str())
            .bind(entry.timestamp.map(|at| at.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn commit_decision_rows(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_ledger SET version = ? WHERE expense_id = ? AND version = ?",
        )
        .bind(i64::from(ledger.version))
        .bind(&ledger.expense_id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let found: Option<i64> =
                sqlx::query_scalar("SELECT version FROM approval_ledger WHERE expense_id = ?")
                    .bind(&ledger.expense_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            let error = match found {
                Some(found) => StoreError::VersionConflict {
                    expense_id: ledger.expense_id.clone(),
                    expected: expected_version,
                    found: to_u32("version", found)?,
                },
                None => StoreError::MissingExpense(ledger.expense_id.clone()),
            };
            return Err(RepositoryError::Store(error));
        }

        for entry in &ledger.entries {
            sqlx::query(
                "UPDATE ledger_entry SET decision = ?, decided_at = ?
                 WHERE expense_id = ? AND approver_id = ?",
            )
            .bind(entry.decision.as_str())
            .bind(entry.timestamp.map(|at| at.to_rfc3339()))
            .bind(&ledger.expense_id.0)
            .bind(&entry.approver_id.0)
            .execute(&mut *tx)
            .await?;
        }

        upsert_expense(&mut tx, expense).await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for SqlApprovalStore {
    async fn insert_rule(&self, rule: &RuleDefinition) -> Result<(), StoreError> {
        Ok(self.insert_rule_row(rule).await?)
    }

    async fn latest_rule(&self, id: &RuleId) -> Result<Option<RuleDefinition>, StoreError> {
        Ok(self.latest_rule_row(id).await?)
    }

    async fn rule_revision(
        &self,
        id: &RuleId,
        revision: u32,
    ) -> Result<Option<RuleDefinition>, StoreError> {
        Ok(self.rule_revision_row(id, revision).await?)
    }

    async fn save_expense(&self, expense: &Expense) -> Result<(), StoreError> {
        Ok(self.save_expense_row(expense).await?)
    }

    async fn find_expense(&self, id: &ExpenseId) -> Result<Option<Expense>, StoreError> {
        Ok(self.find_expense_row(id).await?)
    }

    async fn expenses_for_employee(&self, employee_id: &str) -> Result<Vec<Expense>, StoreError> {
        Ok(self.expense_rows_for_employee(employee_id).await?)
    }

    async fn find_ledger(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Option<ApprovalLedger>, StoreError> {
        Ok(self.find_ledger_row(expense_id).await?)
    }

    async fn open_ledgers(&self) -> Result<Vec<ApprovalLedger>, StoreError> {
        Ok(self.open_ledger_rows().await?)
    }

    async fn commit_submission(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
    ) -> Result<(), StoreError> {
        Ok(self.commit_submission_rows(expense, ledger).await?)
    }

    async fn commit_decision(
        &self,
        expense: &Expense,
        ledger: &ApprovalLedger,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        Ok(self.commit_decision_rows(expense, ledger, expected_version).await?)
    }
}

async fn upsert_expense(
    conn: &mut SqliteConnection,
    expense: &Expense,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO expense (id, employee_id, description, category, expense_date, paid_by,
                              remarks, amount, currency_code, status, rule_id, created_at,
                              updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             employee_id = excluded.employee_id,
             description = excluded.description,
             category = excluded.category,
             expense_date = excluded.expense_date,
             paid_by = excluded.paid_by,
             remarks = excluded.remarks,
             amount = excluded.amount,
             currency_code = excluded.currency_code,
             status = excluded.status,
             rule_id = excluded.rule_id,
             updated_at = excluded.updated_at",
    )
    .bind(&expense.id.0)
    .bind(&expense.employee_id)
    .bind(&expense.description)
    .bind(&expense.category)
    .bind(expense.expense_date.map(|date| date.format("%Y-%m-%d").to_string()))
    .bind(&expense.paid_by)
    .bind(&expense.remarks)
    .bind(expense.amount.to_string())
    .bind(&expense.currency_code)
    .bind(expense.status.as_str())
    .bind(expense.rule_id.as_ref().map(|id| id.0.clone()))
    .bind(expense.created_at.to_rfc3339())
    .bind(expense.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn ledger_with_entries(
    conn: &mut SqliteConnection,
    row: &SqliteRow,
) -> Result<ApprovalLedger, RepositoryError> {
    let expense_id = ExpenseId(row.try_get("expense_id")?);
    let entries = sqlx::query(
        "SELECT approver_id, decision, decided_at FROM ledger_entry
         WHERE expense_id = ?
         ORDER BY position ASC",
    )
    .bind(&expense_id.0)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(entry_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(ApprovalLedger {
        expense_id,
        rule_id: RuleId(row.try_get("rule_id")?),
        rule_revision: to_u32("rule_revision", row.try_get("rule_revision")?)?,
        version: to_u32("version", row.try_get("version")?)?,
        entries,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, RepositoryError> {
    let decision_raw: String = row.try_get("decision")?;
    let decision = Decision::parse(&decision_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("invalid decision: {decision_raw}")))?;
    let decided_at: Option<String> = row.try_get("decided_at")?;

    Ok(LedgerEntry {
        approver_id: ApproverId(row.try_get("approver_id")?),
        decision,
        timestamp: decided_at.map(|raw| parse_timestamp("decided_at", &raw)).transpose()?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<RuleDefinition, RepositoryError> {
    let manager_json: Option<String> = row.try_get("manager_json")?;
    let manager = manager_json
        .map(|raw| serde_json::from_str::<Approver>(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid manager_json: {error}")))?;
    let approvers_json: String = row.try_get("approvers_json")?;
    let approvers = serde_json::from_str::<Vec<Approver>>(&approvers_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid approvers_json: {error}")))?;

    Ok(RuleDefinition {
        id: RuleId(row.try_get("id")?),
        revision: to_u32("revision", row.try_get("revision")?)?,
        description: row.try_get("description")?,
        applies_to: row.try_get("applies_to")?,
        manager,
        manager_is_approver: row.try_get("manager_is_approver")?,
        sequential: row.try_get("sequential")?,
        min_approval_percentage: row.try_get("min_approval_percentage")?,
        approvers,
    })
}

fn expense_from_row(row: &SqliteRow) -> Result<Expense, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = ExpenseStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("invalid expense status: {status_raw}")))?;
    let amount_raw: String = row.try_get("amount")?;
    let amount = Decimal::from_str(&amount_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid amount `{amount_raw}`: {error}")))?;
    let expense_date = row
        .try_get::<Option<String>, _>("expense_date")?
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|error| RepositoryError::Decode(format!("invalid expense_date: {error}")))
        })
        .transpose()?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Expense {
        id: ExpenseId(row.try_get("id")?),
        employee_id: row.try_get("employee_id")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        expense_date,
        paid_by: row.try_get("paid_by")?,
        remarks: row.try_get("remarks")?,
        amount,
        currency_code: row.try_get("currency_code")?,
        status,
        rule_id: row.try_get::<Option<String>, _>("rule_id")?.map(RuleId),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid {field} `{raw}`: {error}")))
}

fn to_u32(field: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{field} out of range: {value}")))
}
