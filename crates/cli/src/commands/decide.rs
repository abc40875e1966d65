use outlay_core::approvals::DecisionCommand;
use outlay_core::domain::expense::ExpenseId;
use outlay_core::domain::rule::ApproverId;
use outlay_core::ledger::Verdict;

use crate::commands::{audit_context, load_config, open_service, runtime, CommandResult};

pub fn run(expense_id: &str, approver_id: &str, verdict: Verdict) -> CommandResult {
    let config = match load_config("decide") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("decide") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let service = match open_service("decide", &config).await {
            Ok(service) => service,
            Err(failure) => return failure,
        };
        let context = audit_context(&format!("approver:{approver_id}"));
        let command = DecisionCommand {
            expense_id: ExpenseId(expense_id.to_string()),
            acting_approver_id: ApproverId(approver_id.to_string()),
            verdict,
        };

        let result = match service.record_decision(command, &context).await {
            Ok(outcome) => CommandResult::success_with_data(
                "decide",
                format!(
                    "expense `{}` is {} after decision by `{approver_id}`",
                    outcome.expense.id,
                    outcome.expense.status.as_str()
                ),
                &outcome,
            ),
            Err(error) => {
                CommandResult::from_application_error("decide", error, &context.correlation_id)
            }
        };
        service.store().pool().close().await;
        result
    })
}
