use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::approvals::{evaluate, validate, ApprovalStore, EvaluationResult, EvaluationStatus, StoreError};
use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::config::ApprovalsConfig;
use crate::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use crate::domain::rule::{
    ApproverId, RuleDefinition, RuleDraft, RuleId, DEFAULT_MIN_APPROVAL_PERCENTAGE,
};
use crate::errors::ApplicationError;
use crate::flows::{
    applied_transition_event, rejected_transition_event, ExpenseAction, ExpenseEvent,
    ExpenseTransitionError, TransitionOutcome,
};
use crate::ledger::{ApprovalLedger, Verdict};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalSettings {
    pub default_min_approval_percentage: i32,
    pub max_conflict_retries: u32,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self { default_min_approval_percentage: DEFAULT_MIN_APPROVAL_PERCENTAGE, max_conflict_retries: 3 }
    }
}

impl From<&ApprovalsConfig> for ApprovalSettings {
    fn from(config: &ApprovalsConfig) -> Self {
        Self {
            default_min_approval_percentage: config.default_min_approval_percentage,
            max_conflict_retries: config.max_conflict_retries,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCommand {
    pub expense_id: ExpenseId,
    pub acting_approver_id: ApproverId,
    pub verdict: Verdict,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub expense: Expense,
    pub ledger: ApprovalLedger,
    pub evaluation: EvaluationResult,
    /// Follow-ups for the notification layer; empty while the expense waits.
    pub actions: Vec<ExpenseAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub expense: Expense,
    pub ledger: ApprovalLedger,
    pub evaluation: EvaluationResult,
    pub actions: Vec<ExpenseAction>,
}

/// One expense an approver can act on right now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub expense_id: ExpenseId,
    pub rule_id: RuleId,
    pub rule_revision: u32,
    pub employee_id: String,
    pub description: String,
    pub amount: Decimal,
    pub currency_code: String,
    pub submitted_at: DateTime<Utc>,
    pub required: bool,
}

/// Drives rules, ledgers and the expense lifecycle against a store.
pub struct ApprovalService<S, A> {
    store: S,
    audit: A,
    settings: ApprovalSettings,
}

impl<S, A> ApprovalService<S, A>
where
    S: ApprovalStore,
    A: AuditSink,
{
    pub fn new(store: S, audit: A, settings: ApprovalSettings) -> Self {
        Self { store, audit, settings }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    /// Validates the rule and stores it as the next revision of its id.
    pub async fn define_rule(
        &self,
        rule: RuleDefinition,
        context: &AuditContext,
    ) -> Result<RuleDefinition, ApplicationError> {
        if let Err(error) = validate(&rule) {
            self.audit.emit(
                AuditEvent::from_context(
                    context,
                    "rule.rejected",
                    AuditCategory::Rule,
                    AuditOutcome::Rejected,
                )
                .with_metadata("rule_id", rule.id.0.clone())
                .with_metadata("error", error.to_string()),
            );
            return Err(error.into());
        }

        let next_revision = self
            .store
            .latest_rule(&rule.id)
            .await?
            .map(|latest| latest.revision.saturating_add(1))
            .unwrap_or(1);
        let rule = rule.with_revision(next_revision);
        self.store.insert_rule(&rule).await?;

        tracing::info!(
            event_name = "approvals.rule.defined",
            correlation_id = %context.correlation_id,
            rule_id = %rule.id,
            revision = rule.revision,
            approvers = rule.effective_approvers().count(),
            "approval rule stored"
        );
        self.audit.emit(
            AuditEvent::from_context(context, "rule.defined", AuditCategory::Rule, AuditOutcome::Success)
                .with_metadata("rule_id", rule.id.0.clone())
                .with_metadata("revision", rule.revision.to_string()),
        );

        Ok(rule)
    }

    /// Converts the admin form and stores it, using the configured default
    /// threshold when the form leaves it blank.
    pub async fn define_rule_from_draft(
        &self,
        draft: RuleDraft,
        context: &AuditContext,
    ) -> Result<RuleDefinition, ApplicationError> {
        let rule_id = draft.id.clone();
        match draft.into_rule(self.settings.default_min_approval_percentage) {
            Ok(rule) => self.define_rule(rule, context).await,
            Err(error) => {
                self.audit.emit(
                    AuditEvent::from_context(
                        context,
                        "rule.rejected",
                        AuditCategory::Rule,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("rule_id", rule_id)
                    .with_metadata("error", error.to_string()),
                );
                Err(error.into())
            }
        }
    }

    /// Creates or updates an expense that has not been submitted yet.
    pub async fn save_draft(
        &self,
        expense: Expense,
        context: &AuditContext,
    ) -> Result<Expense, ApplicationError> {
        let context = context.for_expense(&expense.id);
        let state = match self.store.find_expense(&expense.id).await? {
            Some(stored) if stored.status != ExpenseStatus::Draft => stored.status,
            _ => expense.status,
        };
        if state != ExpenseStatus::Draft {
            let error = ExpenseTransitionError::NotEditable { state };
            self.audit.emit(rejected_transition_event(&context, &error));
            return Err(error.into());
        }

        self.store.save_expense(&expense).await?;
        self.audit.emit(
            AuditEvent::from_context(
                &context,
                "expense.draft_saved",
                AuditCategory::Lifecycle,
                AuditOutcome::Success,
            )
            .with_metadata("employee_id", expense.employee_id.clone()),
        );
        Ok(expense)
    }

    /// Seeds a ledger from the latest revision of `rule_id` and moves the
    /// expense to waiting-approval. A rule with nothing to wait for settles
    /// the expense in the same commit.
    pub async fn submit_expense(
        &self,
        expense_id: &ExpenseId,
        rule_id: &RuleId,
        context: &AuditContext,
    ) -> Result<Submission, ApplicationError> {
        let context = context.for_expense(expense_id);
        let mut expense = self.load_expense(expense_id).await?;
        let rule = self
            .store
            .latest_rule(rule_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("rule `{rule_id}`")))?;

        let mut transitions = vec![self.advance(&mut expense, ExpenseEvent::Submitted, &context)?];
        expense.rule_id = Some(rule.id.clone());

        let ledger = ApprovalLedger::create(&rule, expense_id.clone());
        let evaluation = evaluate(&rule, &ledger);
        if let Some(event) = settling_event(evaluation.status) {
            transitions.push(self.advance(&mut expense, event, &context)?);
        }

        if let Err(error) = self.store.commit_submission(&expense, &ledger).await {
            self.emit_failure(&context, "expense.submit_failed", AuditCategory::Persistence, &error);
            return Err(error.into());
        }

        tracing::info!(
            event_name = "approvals.expense.submitted",
            correlation_id = %context.correlation_id,
            expense_id = %expense.id,
            rule_id = %rule.id,
            revision = rule.revision,
            status = expense.status.as_str(),
            "expense submitted for approval"
        );
        self.audit.emit(
            AuditEvent::from_context(
                &context,
                "expense.submitted",
                AuditCategory::Lifecycle,
                AuditOutcome::Success,
            )
            .with_metadata("rule_id", rule.id.0.clone())
            .with_metadata("revision", rule.revision.to_string())
            .with_metadata("status", expense.status.as_str()),
        );
        for outcome in &transitions {
            self.audit.emit(applied_transition_event(&context, outcome));
        }

        Ok(Submission { expense, ledger, evaluation, actions: follow_ups(&transitions) })
    }

    /// Records one approver's verdict. Concurrent writers on the same ledger
    /// are resolved by re-reading and re-applying, up to the configured retry
    /// budget.
    pub async fn record_decision(
        &self,
        command: DecisionCommand,
        context: &AuditContext,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let context = context.for_expense(&command.expense_id);
        let mut attempt = 0u32;

        loop {
            let mut expense = self.load_expense(&command.expense_id).await?;
            if expense.status != ExpenseStatus::WaitingApproval {
                return Err(self
                    .reject_transition(&context, expense.status, verdict_event(command.verdict))
                    .into());
            }

            let ledger = self.load_ledger(&command.expense_id).await?;
            let rule = self.pinned_rule(&ledger).await?;

            let decided =
                match ledger.record_decision(&rule, &command.acting_approver_id, command.verdict) {
                    Ok(decided) => decided,
                    Err(error) => {
                        self.audit.emit(
                            AuditEvent::from_context(
                                &context,
                                "ledger.decision_rejected",
                                AuditCategory::Ledger,
                                AuditOutcome::Rejected,
                            )
                            .with_metadata("approver_id", command.acting_approver_id.0.clone())
                            .with_metadata("error", error.to_string()),
                        );
                        return Err(error.into());
                    }
                };

            let evaluation = evaluate(&rule, &decided);
            let transition = match settling_event(evaluation.status) {
                Some(event) => Some(self.advance(&mut expense, event, &context)?),
                None => None,
            };

            match self.store.commit_decision(&expense, &decided, ledger.version).await {
                Ok(()) => {
                    self.emit_decision(&context, &command, &decided, &evaluation);
                    let transitions: Vec<TransitionOutcome> = transition.into_iter().collect();
                    for outcome in &transitions {
                        self.audit.emit(applied_transition_event(&context, outcome));
                    }
                    return Ok(DecisionOutcome {
                        expense,
                        ledger: decided,
                        evaluation,
                        actions: follow_ups(&transitions),
                    });
                }
                Err(StoreError::VersionConflict { expected, found, .. })
                    if attempt < self.settings.max_conflict_retries =>
                {
                    attempt += 1;
                    tracing::warn!(
                        event_name = "approvals.ledger.version_conflict",
                        correlation_id = %context.correlation_id,
                        expense_id = %command.expense_id,
                        expected,
                        found,
                        attempt,
                        "ledger changed underneath decision, retrying"
                    );
                }
                Err(error) => {
                    self.emit_failure(
                        &context,
                        "ledger.decision_failed",
                        AuditCategory::Persistence,
                        &error,
                    );
                    return Err(error.into());
                }
            }
        }
    }

    /// Current evaluation of a submitted expense. Nothing is written.
    pub async fn evaluate_expense(
        &self,
        expense_id: &ExpenseId,
        context: &AuditContext,
    ) -> Result<EvaluationResult, ApplicationError> {
        let context = context.for_expense(expense_id);
        let ledger = self.load_ledger(expense_id).await?;
        let rule = self.pinned_rule(&ledger).await?;
        let evaluation = evaluate(&rule, &ledger);

        tracing::debug!(
            event_name = "approvals.expense.evaluated",
            correlation_id = %context.correlation_id,
            expense_id = %expense_id,
            status = evaluation.status.as_str(),
            percentage = evaluation.percentage,
            "expense evaluated"
        );
        self.audit.emit(
            AuditEvent::from_context(
                &context,
                "expense.evaluated",
                AuditCategory::Evaluation,
                AuditOutcome::Success,
            )
            .with_metadata("status", evaluation.status.as_str())
            .with_metadata("percentage", evaluation.percentage.to_string()),
        );
        Ok(evaluation)
    }

    /// Cancels a draft or waiting expense. Cancelling a waiting expense bumps
    /// its ledger version so in-flight decisions on it fail their commit.
    pub async fn cancel_expense(
        &self,
        expense_id: &ExpenseId,
        context: &AuditContext,
    ) -> Result<Expense, ApplicationError> {
        let context = context.for_expense(expense_id);
        let mut expense = self.load_expense(expense_id).await?;
        let from = expense.status;
        let outcome = self.advance(&mut expense, ExpenseEvent::CancelRequested, &context)?;

        let committed = if from == ExpenseStatus::WaitingApproval {
            let ledger = self.load_ledger(expense_id).await?;
            let mut closed = ledger.clone();
            closed.version = closed.version.saturating_add(1);
            self.store.commit_decision(&expense, &closed, ledger.version).await
        } else {
            self.store.save_expense(&expense).await
        };
        if let Err(error) = committed {
            self.emit_failure(&context, "expense.cancel_failed", AuditCategory::Persistence, &error);
            return Err(error.into());
        }

        tracing::info!(
            event_name = "approvals.expense.cancelled",
            correlation_id = %context.correlation_id,
            expense_id = %expense.id,
            from = from.as_str(),
            "expense cancelled"
        );
        self.audit.emit(
            AuditEvent::from_context(
                &context,
                "expense.cancelled",
                AuditCategory::Lifecycle,
                AuditOutcome::Success,
            )
            .with_metadata("from", from.as_str()),
        );
        self.audit.emit(applied_transition_event(&context, &outcome));
        Ok(expense)
    }

    /// Waiting expenses on which `approver_id` may decide right now, oldest
    /// submission first.
    pub async fn approval_queue(
        &self,
        approver_id: &ApproverId,
        context: &AuditContext,
    ) -> Result<Vec<QueueItem>, ApplicationError> {
        let mut queue = Vec::new();
        for ledger in self.store.open_ledgers().await? {
            let rule = self.pinned_rule(&ledger).await?;
            if !ledger.actionable_approvers(&rule).contains(approver_id) {
                continue;
            }
            let Some(expense) = self.store.find_expense(&ledger.expense_id).await? else {
                continue;
            };
            queue.push(QueueItem {
                expense_id: expense.id,
                rule_id: ledger.rule_id,
                rule_revision: ledger.rule_revision,
                employee_id: expense.employee_id,
                description: expense.description,
                amount: expense.amount,
                currency_code: expense.currency_code,
                submitted_at: expense.updated_at,
                required: rule.is_required(approver_id),
            });
        }
        queue.sort_by(|left, right| {
            left.submitted_at.cmp(&right.submitted_at).then_with(|| left.expense_id.cmp(&right.expense_id))
        });

        self.audit.emit(
            AuditEvent::from_context(
                context,
                "approver.queue_listed",
                AuditCategory::Ledger,
                AuditOutcome::Success,
            )
            .with_metadata("approver_id", approver_id.0.clone())
            .with_metadata("count", queue.len().to_string()),
        );
        Ok(queue)
    }

    pub async fn expenses_for_employee(
        &self,
        employee_id: &str,
        context: &AuditContext,
    ) -> Result<Vec<Expense>, ApplicationError> {
        let expenses = self.store.expenses_for_employee(employee_id).await?;
        self.audit.emit(
            AuditEvent::from_context(
                context,
                "employee.history_listed",
                AuditCategory::Lifecycle,
                AuditOutcome::Success,
            )
            .with_metadata("employee_id", employee_id)
            .with_metadata("count", expenses.len().to_string()),
        );
        Ok(expenses)
    }

    async fn load_expense(&self, expense_id: &ExpenseId) -> Result<Expense, ApplicationError> {
        self.store
            .find_expense(expense_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("expense `{expense_id}`")))
    }

    async fn load_ledger(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<ApprovalLedger, ApplicationError> {
        self.store
            .find_ledger(expense_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("ledger for expense `{expense_id}`")))
    }

    async fn pinned_rule(&self, ledger: &ApprovalLedger) -> Result<RuleDefinition, ApplicationError> {
        self.store.rule_revision(&ledger.rule_id, ledger.rule_revision).await?.ok_or_else(|| {
            ApplicationError::NotFound(format!(
                "rule `{}` revision {}",
                ledger.rule_id, ledger.rule_revision
            ))
        })
    }

    /// Applies `event` in memory. Only rejections are audited here; applied
    /// transitions are audited once the caller has committed them.
    fn advance(
        &self,
        expense: &mut Expense,
        event: ExpenseEvent,
        context: &AuditContext,
    ) -> Result<TransitionOutcome, ExpenseTransitionError> {
        expense.apply(event).map_err(|error| {
            self.audit.emit(rejected_transition_event(context, &error));
            error
        })
    }

    fn reject_transition(
        &self,
        context: &AuditContext,
        state: ExpenseStatus,
        event: ExpenseEvent,
    ) -> ExpenseTransitionError {
        let error = ExpenseTransitionError::InvalidTransition { state, event };
        self.audit.emit(rejected_transition_event(context, &error));
        error
    }

    fn emit_decision(
        &self,
        context: &AuditContext,
        command: &DecisionCommand,
        ledger: &ApprovalLedger,
        evaluation: &EvaluationResult,
    ) {
        tracing::info!(
            event_name = "approvals.ledger.decision_recorded",
            correlation_id = %context.correlation_id,
            expense_id = %command.expense_id,
            approver_id = %command.acting_approver_id,
            verdict = ?command.verdict,
            version = ledger.version,
            status = evaluation.status.as_str(),
            "approval decision recorded"
        );
        self.audit.emit(
            AuditEvent::from_context(
                context,
                "ledger.decision_recorded",
                AuditCategory::Ledger,
                AuditOutcome::Success,
            )
            .with_metadata("approver_id", command.acting_approver_id.0.clone())
            .with_metadata("decision", crate::ledger::Decision::from(command.verdict).as_str())
            .with_metadata("version", ledger.version.to_string())
            .with_metadata("status", evaluation.status.as_str()),
        );
    }

    fn emit_failure(
        &self,
        context: &AuditContext,
        event_type: &str,
        category: AuditCategory,
        error: &StoreError,
    ) {
        tracing::warn!(
            event_name = event_type,
            correlation_id = %context.correlation_id,
            error = %error,
            "approval store rejected write"
        );
        self.audit.emit(
            AuditEvent::from_context(context, event_type, category, AuditOutcome::Failed)
                .with_metadata("error", error.to_string()),
        );
    }
}

fn follow_ups(transitions: &[TransitionOutcome]) -> Vec<ExpenseAction> {
    transitions.iter().flat_map(|outcome| outcome.actions.iter().cloned()).collect()
}

fn settling_event(status: EvaluationStatus) -> Option<ExpenseEvent> {
    match status {
        EvaluationStatus::Approved => Some(ExpenseEvent::ApprovalGranted),
        EvaluationStatus::Rejected => Some(ExpenseEvent::ApprovalDenied),
        EvaluationStatus::Pending => None,
    }
}

fn verdict_event(verdict: Verdict) -> ExpenseEvent {
    match verdict {
        Verdict::Approved => ExpenseEvent::ApprovalGranted,
        Verdict::Rejected => ExpenseEvent::ApprovalDenied,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::{ApprovalService, ApprovalSettings, DecisionCommand};
    use crate::approvals::{
        ApprovalStore, EvaluationStatus, InMemoryApprovalStore, StoreError, ValidationError,
    };
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::expense::{Expense, ExpenseId, ExpenseStatus};
    use crate::domain::rule::{Approver, ApproverId, RuleDefinition, RuleDraft, RuleId};
    use crate::errors::{ApplicationError, DomainError};
    use crate::flows::{ExpenseAction, ExpenseTransitionError};
    use crate::ledger::{ApprovalLedger, Decision, LedgerError, Verdict};

    fn context() -> AuditContext {
        AuditContext::new(None, "req-test", "test-harness")
    }

    fn settings() -> ApprovalSettings {
        ApprovalSettings { default_min_approval_percentage: 100, max_conflict_retries: 2 }
    }

    fn approver(raw: &str) -> ApproverId {
        ApproverId(raw.to_string())
    }

    fn expense_id(raw: &str) -> ExpenseId {
        ExpenseId(raw.to_string())
    }

    fn trio(min: i32, sequential: bool) -> RuleDefinition {
        RuleDefinition::builder("rule-travel")
            .min_approval_percentage(min)
            .sequential(sequential)
            .approvers([
                Approver::new("a", "Sarah Johnson", false),
                Approver::new("b", "Michael Chen", false),
                Approver::new("c", "Emily Davis", false),
            ])
            .build()
            .expect("valid rule")
    }

    fn decision(expense: &str, approver_id: &str, verdict: Verdict) -> DecisionCommand {
        DecisionCommand {
            expense_id: expense_id(expense),
            acting_approver_id: approver(approver_id),
            verdict,
        }
    }

    async fn submitted<S: ApprovalStore>(
        service: &ApprovalService<S, InMemoryAuditSink>,
        rule: RuleDefinition,
        expense: &str,
    ) {
        let rule_id = rule.id.clone();
        service.define_rule(rule, &context()).await.expect("rule stored");
        service
            .save_draft(
                Expense::draft(expense, "emp-1", "Flight", Decimal::new(32_000, 2), "EUR"),
                &context(),
            )
            .await
            .expect("draft saved");
        service.submit_expense(&expense_id(expense), &rule_id, &context()).await.expect("submitted");
    }

    fn service() -> ApprovalService<InMemoryApprovalStore, InMemoryAuditSink> {
        ApprovalService::new(InMemoryApprovalStore::default(), InMemoryAuditSink::default(), settings())
    }

    #[tokio::test]
    async fn define_rule_assigns_increasing_revisions() {
        let service = service();
        let first = service.define_rule(trio(60, false), &context()).await.expect("rev 1");
        let second = service.define_rule(trio(100, false), &context()).await.expect("rev 2");

        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(service.audit.events_of_type("rule.defined").len(), 2);
    }

    #[tokio::test]
    async fn invalid_draft_is_refused_and_audited() {
        let service = service();
        let error = service
            .define_rule_from_draft(
                RuleDraft { id: "rule-empty".to_string(), ..RuleDraft::default() },
                &context(),
            )
            .await
            .expect_err("no approvers");

        assert_eq!(
            error,
            ApplicationError::Domain(DomainError::Validation(ValidationError::EmptyApproverSet))
        );
        assert_eq!(service.audit.events_of_type("rule.rejected").len(), 1);
        assert!(service
            .store()
            .latest_rule(&RuleId("rule-empty".to_string()))
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn submission_seeds_pending_ledger_and_waits() {
        let service = service();
        submitted(&service, trio(60, false), "EXP-1").await;

        let expense =
            service.store().find_expense(&expense_id("EXP-1")).await.expect("query").expect("exists");
        assert_eq!(expense.status, ExpenseStatus::WaitingApproval);
        assert_eq!(expense.rule_id, Some(RuleId("rule-travel".to_string())));

        let ledger =
            service.store().find_ledger(&expense_id("EXP-1")).await.expect("query").expect("exists");
        assert_eq!(ledger.entries.len(), 3);
        assert!(ledger.entries.iter().all(|entry| entry.decision == Decision::Pending));
    }

    #[tokio::test]
    async fn zero_threshold_rule_approves_on_submission() {
        let service = service();
        service.define_rule(trio(0, true), &context()).await.expect("rule");
        service
            .save_draft(
                Expense::draft("EXP-0", "emp-1", "Parking", Decimal::new(500, 2), "USD"),
                &context(),
            )
            .await
            .expect("draft");

        let submission = service
            .submit_expense(&expense_id("EXP-0"), &RuleId("rule-travel".to_string()), &context())
            .await
            .expect("submitted");

        assert_eq!(submission.evaluation.status, EvaluationStatus::Approved);
        assert_eq!(submission.expense.status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn failed_submission_commit_leaves_no_applied_transitions() {
        let service = service();
        let rule = service.define_rule(trio(60, false), &context()).await.expect("rule");
        let draft = Expense::draft("EXP-1", "emp-1", "Flight", Decimal::new(32_000, 2), "EUR");
        service.save_draft(draft.clone(), &context()).await.expect("draft");
        service
            .store()
            .commit_submission(&draft, &ApprovalLedger::create(&rule, expense_id("EXP-1")))
            .await
            .expect("stray ledger");

        let error = service
            .submit_expense(&expense_id("EXP-1"), &rule.id, &context())
            .await
            .expect_err("ledger already exists");

        assert!(matches!(error, ApplicationError::Conflict(_)));
        assert!(service.audit.events_of_type("expense.transition_applied").is_empty());
        assert_eq!(service.audit.events_of_type("expense.submit_failed").len(), 1);
    }

    #[tokio::test]
    async fn submission_reports_follow_up_actions() {
        let service = service();
        submitted(&service, trio(60, false), "EXP-1").await;
        assert_eq!(service.audit.events_of_type("expense.transition_applied").len(), 1);

        service.define_rule(trio(0, false), &context()).await.expect("rev 2");
        service
            .save_draft(
                Expense::draft("EXP-0", "emp-1", "Parking", Decimal::new(500, 2), "USD"),
                &context(),
            )
            .await
            .expect("draft");
        let settled = service
            .submit_expense(&expense_id("EXP-0"), &RuleId("rule-travel".to_string()), &context())
            .await
            .expect("submitted");

        assert_eq!(
            settled.actions,
            vec![
                ExpenseAction::SeedLedger,
                ExpenseAction::NotifyApprovers,
                ExpenseAction::CloseLedger,
                ExpenseAction::NotifySubmitter,
            ]
        );
        assert_eq!(service.audit.events_of_type("expense.transition_applied").len(), 3);
    }

    #[tokio::test]
    async fn submitted_expense_can_no_longer_be_edited_as_draft() {
        let service = service();
        submitted(&service, trio(60, false), "EXP-1").await;

        let error = service
            .save_draft(
                Expense::draft("EXP-1", "emp-1", "Flight (edited)", Decimal::new(1_000, 2), "EUR"),
                &context(),
            )
            .await
            .expect_err("already waiting");

        assert_eq!(
            error,
            ApplicationError::Domain(DomainError::ExpenseTransition(
                ExpenseTransitionError::NotEditable { state: ExpenseStatus::WaitingApproval }
            ))
        );
        assert_eq!(service.audit.events_of_type("expense.transition_rejected").len(), 1);
    }

    #[tokio::test]
    async fn decisions_settle_expense_once_threshold_is_met() {
        let service = service();
        submitted(&service, trio(60, false), "EXP-1").await;

        let first = service
            .record_decision(decision("EXP-1", "a", Verdict::Approved), &context())
            .await
            .expect("first");
        assert_eq!(first.evaluation.status, EvaluationStatus::Pending);
        assert_eq!(first.expense.status, ExpenseStatus::WaitingApproval);
        assert!(first.actions.is_empty());

        let second = service
            .record_decision(decision("EXP-1", "c", Verdict::Approved), &context())
            .await
            .expect("second");
        assert_eq!(second.evaluation.status, EvaluationStatus::Approved);
        assert_eq!(second.expense.status, ExpenseStatus::Approved);
        assert_eq!(second.ledger.version, 2);
        assert_eq!(second.actions, vec![ExpenseAction::CloseLedger, ExpenseAction::NotifySubmitter]);

        let late = service
            .record_decision(decision("EXP-1", "b", Verdict::Rejected), &context())
            .await
            .expect_err("expense already settled");
        assert!(matches!(
            late,
            ApplicationError::Domain(DomainError::ExpenseTransition(
                ExpenseTransitionError::InvalidTransition { state: ExpenseStatus::Approved, .. }
            ))
        ));
    }

    #[tokio::test]
    async fn out_of_order_sequential_decision_is_refused() {
        let service = service();
        submitted(&service, trio(100, true), "EXP-S").await;

        let error = service
            .record_decision(decision("EXP-S", "b", Verdict::Approved), &context())
            .await
            .expect_err("a decides first");
        assert_eq!(
            error,
            ApplicationError::Domain(DomainError::Ledger(LedgerError::OutOfOrder {
                approver_id: approver("b"),
                waiting_on: approver("a"),
            }))
        );
        assert_eq!(service.audit.events_of_type("ledger.decision_rejected").len(), 1);
    }

    #[tokio::test]
    async fn ledger_stays_pinned_to_revision_it_was_seeded_from() {
        let service = service();
        submitted(&service, trio(100, false), "EXP-1").await;

        let lenient = RuleDefinition::builder("rule-travel")
            .min_approval_percentage(30)
            .approvers([
                Approver::new("a", "Sarah Johnson", false),
                Approver::new("b", "Michael Chen", false),
                Approver::new("c", "Emily Davis", false),
            ])
            .build()
            .expect("valid rule");
        service.define_rule(lenient, &context()).await.expect("rev 2");

        let outcome = service
            .record_decision(decision("EXP-1", "a", Verdict::Approved), &context())
            .await
            .expect("decision");
        assert_eq!(outcome.ledger.rule_revision, 1);
        assert_eq!(outcome.evaluation.status, EvaluationStatus::Pending);
    }

    #[tokio::test]
    async fn queue_lists_only_actionable_expenses() {
        let service = service();
        submitted(&service, trio(100, true), "EXP-1").await;
        service
            .save_draft(
                Expense::draft("EXP-2", "emp-2", "Hotel", Decimal::new(18_000, 2), "EUR"),
                &context(),
            )
            .await
            .expect("draft");
        service
            .submit_expense(&expense_id("EXP-2"), &RuleId("rule-travel".to_string()), &context())
            .await
            .expect("submitted");
        service
            .record_decision(decision("EXP-2", "a", Verdict::Approved), &context())
            .await
            .expect("a decides");

        let queue_a = service.approval_queue(&approver("a"), &context()).await.expect("queue");
        assert_eq!(queue_a.iter().map(|item| item.expense_id.0.as_str()).collect::<Vec<_>>(), ["EXP-1"]);

        let queue_b = service.approval_queue(&approver("b"), &context()).await.expect("queue");
        assert_eq!(queue_b.iter().map(|item| item.expense_id.0.as_str()).collect::<Vec<_>>(), ["EXP-2"]);

        service.cancel_expense(&expense_id("EXP-2"), &context()).await.expect("cancel");
        assert!(service.approval_queue(&approver("b"), &context()).await.expect("queue").is_empty());
    }

    #[tokio::test]
    async fn cancelling_waiting_expense_invalidates_in_flight_decisions() {
        let service = service();
        submitted(&service, trio(100, false), "EXP-1").await;
        let before =
            service.store().find_ledger(&expense_id("EXP-1")).await.expect("query").expect("ledger");

        let cancelled = service.cancel_expense(&expense_id("EXP-1"), &context()).await.expect("cancel");
        assert_eq!(cancelled.status, ExpenseStatus::Cancelled);

        let rule = trio(100, false);
        let stale = before.record_decision(&rule, &approver("a"), Verdict::Approved).expect("decision");
        let error = service
            .store()
            .commit_decision(&cancelled, &stale, before.version)
            .await
            .expect_err("version moved");
        assert!(matches!(error, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn employee_history_is_newest_first() {
        let service = service();
        let mut older = Expense::draft("EXP-OLD", "emp-9", "Taxi", Decimal::new(2_000, 2), "USD");
        older.created_at -= chrono::Duration::days(3);
        service.save_draft(older, &context()).await.expect("draft");
        service
            .save_draft(
                Expense::draft("EXP-NEW", "emp-9", "Lunch", Decimal::new(1_500, 2), "USD"),
                &context(),
            )
            .await
            .expect("draft");

        let history = service.expenses_for_employee("emp-9", &context()).await.expect("history");
        let ids: Vec<&str> = history.iter().map(|expense| expense.id.0.as_str()).collect();
        assert_eq!(ids, vec!["EXP-NEW", "EXP-OLD"]);
    }

    /// Lets another writer slip a decision in before the first commit.
    struct RacingStore {
        inner: InMemoryApprovalStore,
        racer: Mutex<Option<(ApproverId, Verdict)>>,
        always_conflict: bool,
        commits: AtomicU32,
    }

    impl RacingStore {
        fn new(racer: Option<(&str, Verdict)>, always_conflict: bool) -> Self {
            Self {
                inner: InMemoryApprovalStore::default(),
                racer: Mutex::new(racer.map(|(id, verdict)| (approver(id), verdict))),
                always_conflict,
                commits: AtomicU32::new(0),
            }
        }

        async fn race(&self, expense_id: &ExpenseId) -> Result<(), StoreError> {
            let racer = match self.racer.lock() {
                Ok(mut racer) => racer.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let Some((approver_id, verdict)) = racer else {
                return Ok(());
            };
            let (Some(expense), Some(ledger)) =
                (self.inner.find_expense(expense_id).await?, self.inner.find_ledger(expense_id).await?)
            else {
                return Ok(());
            };
            let rule = self
                .inner
                .rule_revision(&ledger.rule_id, ledger.rule_revision)
                .await?
                .ok_or_else(|| StoreError::Backend("rule missing".to_string()))?;
            let decided = ledger
                .record_decision(&rule, &approver_id, verdict)
                .map_err(|error| StoreError::Backend(error.to_string()))?;
            self.inner.commit_decision(&expense, &decided, ledger.version).await
        }
    }

    #[async_trait]
    impl ApprovalStore for RacingStore {
        async fn insert_rule(&self, rule: &RuleDefinition) -> Result<(), StoreError> {
            self.inner.insert_rule(rule).await
        }

        async fn latest_rule(&self, id: &RuleId) -> Result<Option<RuleDefinition>, StoreError> {
            self.inner.latest_rule(id).await
        }

        async fn rule_revision(
            &self,
            id: &RuleId,
            revision: u32,
        ) -> Result<Option<RuleDefinition>, StoreError> {
            self.inner.rule_revision(id, revision).await
        }

        async fn save_expense(&self, expense: &Expense) -> Result<(), StoreError> {
            self.inner.save_expense(expense).await
        }

        async fn find_expense(&self, id: &ExpenseId) -> Result<Option<Expense>, StoreError> {
            self.inner.find_expense(id).await
        }

        async fn expenses_for_employee(&self, employee_id: &str) -> Result<Vec<Expense>, StoreError> {
            self.inner.expenses_for_employee(employee_id).await
        }

        async fn find_ledger(
            &self,
            expense_id: &ExpenseId,
        ) -> Result<Option<ApprovalLedger>, StoreError> {
            self.inner.find_ledger(expense_id).await
        }

        async fn open_ledgers(&self) -> Result<Vec<ApprovalLedger>, StoreError> {
            self.inner.open_ledgers().await
        }

        async fn commit_submission(
            &self,
            expense: &Expense,
            ledger: &ApprovalLedger,
        ) -> Result<(), StoreError> {
            self.inner.commit_submission(expense, ledger).await
        }

        async fn commit_decision(
            &self,
            expense: &Expense,
            ledger: &ApprovalLedger,
            expected_version: u32,
        ) -> Result<(), StoreError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.always_conflict {
                return Err(StoreError::VersionConflict {
                    expense_id: ledger.expense_id.clone(),
                    expected: expected_version,
                    found: expected_version + 1,
                });
            }
            self.race(&ledger.expense_id).await?;
            self.inner.commit_decision(expense, ledger, expected_version).await
        }
    }

    fn racing_service(store: RacingStore) -> ApprovalService<RacingStore, InMemoryAuditSink> {
        ApprovalService::new(store, InMemoryAuditSink::default(), settings())
    }

    #[tokio::test]
    async fn version_conflict_is_retried_against_fresh_ledger() {
        let service = racing_service(RacingStore::new(Some(("b", Verdict::Approved)), false));
        submitted(&service, trio(60, false), "EXP-1").await;

        let outcome = service
            .record_decision(decision("EXP-1", "a", Verdict::Approved), &context())
            .await
            .expect("retried decision");

        assert_eq!(outcome.ledger.version, 2);
        assert_eq!(outcome.ledger.entry(&approver("a")).map(|e| e.decision), Some(Decision::Approved));
        assert_eq!(outcome.ledger.entry(&approver("b")).map(|e| e.decision), Some(Decision::Approved));
        assert_eq!(outcome.evaluation.status, EvaluationStatus::Approved);
        assert_eq!(outcome.expense.status, ExpenseStatus::Approved);
        assert_eq!(service.store().commits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicate_decision_surfaces_as_already_decided() {
        let service = racing_service(RacingStore::new(Some(("a", Verdict::Rejected)), false));
        submitted(&service, trio(60, false), "EXP-1").await;

        let error = service
            .record_decision(decision("EXP-1", "a", Verdict::Approved), &context())
            .await
            .expect_err("racer decided first");

        assert_eq!(
            error,
            ApplicationError::Domain(DomainError::Ledger(LedgerError::AlreadyDecided {
                approver_id: approver("a"),
                decision: Decision::Rejected,
            }))
        );
    }

    #[tokio::test]
    async fn exhausted_retry_budget_reports_conflict() {
        let service = racing_service(RacingStore::new(None, true));
        submitted(&service, trio(60, false), "EXP-1").await;

        let error = service
            .record_decision(decision("EXP-1", "a", Verdict::Approved), &context())
            .await
            .expect_err("always conflicting");

        assert!(matches!(error, ApplicationError::Conflict(_)));
        assert_eq!(service.store().commits.load(Ordering::SeqCst), 3);
        assert_eq!(service.audit.events_of_type("ledger.decision_failed").len(), 1);
    }
}
