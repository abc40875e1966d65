use rust_decimal::Decimal;

use outlay_core::approvals::{
    ApprovalService, ApprovalSettings, ApprovalStore, DecisionCommand, EvaluationStatus,
};
use outlay_core::audit::{AuditContext, InMemoryAuditSink};
use outlay_core::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use outlay_core::domain::rule::{Approver, ApproverId, RuleDefinition, RuleId};
use outlay_core::errors::{ApplicationError, DomainError};
use outlay_core::ledger::{LedgerError, Verdict};
use outlay_db::{connect_with_settings, migrations, SqlApprovalStore};

type TestResult = Result<(), String>;

async fn service() -> Result<ApprovalService<SqlApprovalStore, InMemoryAuditSink>, String> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| format!("connect: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrate: {error}"))?;
    Ok(ApprovalService::new(
        SqlApprovalStore::new(pool),
        InMemoryAuditSink::default(),
        ApprovalSettings::default(),
    ))
}

fn context() -> AuditContext {
    AuditContext::new(None, "req-sql", "integration-test")
}

fn finance_rule() -> Result<RuleDefinition, String> {
    RuleDefinition::builder("rule-finance")
        .min_approval_percentage(50)
        .manager(Approver::new("mgr", "Robert Wilson", true))
        .manager_is_approver(true)
        .approvers([
            Approver::new("x", "Michael Chen", false),
            Approver::new("y", "Emily Davis", false),
        ])
        .build()
        .map_err(|error| error.to_string())
}

fn command(approver: &str, verdict: Verdict) -> DecisionCommand {
    DecisionCommand {
        expense_id: ExpenseId("EXP-42".to_string()),
        acting_approver_id: ApproverId(approver.to_string()),
        verdict,
    }
}

#[tokio::test]
async fn manager_and_one_optional_approval_settle_expense() -> TestResult {
    let service = service().await?;
    service.define_rule(finance_rule()?, &context()).await.map_err(|e| e.to_string())?;
    service
        .save_draft(
            Expense::draft("EXP-42", "emp-3", "Team offsite", Decimal::new(75_000, 2), "GBP"),
            &context(),
        )
        .await
        .map_err(|e| e.to_string())?;
    let submission = service
        .submit_expense(
            &ExpenseId("EXP-42".to_string()),
            &RuleId("rule-finance".to_string()),
            &context(),
        )
        .await
        .map_err(|e| e.to_string())?;
    if submission.evaluation.status != EvaluationStatus::Pending {
        return Err("fresh submission should be pending".to_string());
    }

    let queue = service
        .approval_queue(&ApproverId("mgr".to_string()), &context())
        .await
        .map_err(|e| e.to_string())?;
    if queue.len() != 1 || !queue[0].required {
        return Err(format!("manager queue should hold one required item, got {queue:?}"));
    }

    service
        .record_decision(command("x", Verdict::Approved), &context())
        .await
        .map_err(|e| e.to_string())?;
    let outcome = service
        .record_decision(command("mgr", Verdict::Approved), &context())
        .await
        .map_err(|e| e.to_string())?;

    if outcome.evaluation.status != EvaluationStatus::Approved {
        return Err(format!("expected approval, got {:?}", outcome.evaluation));
    }
    let stored = service
        .store()
        .find_expense(&ExpenseId("EXP-42".to_string()))
        .await
        .map_err(|e| e.to_string())?
        .ok_or("expense should exist")?;
    if stored.status != ExpenseStatus::Approved {
        return Err(format!("stored status should be approved, got {:?}", stored.status));
    }
    Ok(())
}

#[tokio::test]
async fn repeated_decision_is_refused_by_persisted_ledger() -> TestResult {
    let service = service().await?;
    service.define_rule(finance_rule()?, &context()).await.map_err(|e| e.to_string())?;
    service
        .save_draft(
            Expense::draft("EXP-42", "emp-3", "Team offsite", Decimal::new(75_000, 2), "GBP"),
            &context(),
        )
        .await
        .map_err(|e| e.to_string())?;
    service
        .submit_expense(
            &ExpenseId("EXP-42".to_string()),
            &RuleId("rule-finance".to_string()),
            &context(),
        )
        .await
        .map_err(|e| e.to_string())?;

    service
        .record_decision(command("y", Verdict::Rejected), &context())
        .await
        .map_err(|e| e.to_string())?;
    match service.record_decision(command("y", Verdict::Approved), &context()).await {
        Err(ApplicationError::Domain(DomainError::Ledger(LedgerError::AlreadyDecided {
            ..
        }))) => Ok(()),
        other => Err(format!("expected AlreadyDecided, got {other:?}")),
    }
}
