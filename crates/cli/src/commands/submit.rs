use std::path::Path;

use chrono::NaiveDate;
use outlay_core::domain::expense::Expense;
use outlay_core::domain::rule::RuleId;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::commands::{audit_context, load_config, open_service, read_json, runtime, CommandResult};

/// Expense fields as entered on the employee submission screen.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseForm {
    pub id: String,
    pub employee_id: String,
    pub description: String,
    pub amount: Decimal,
    pub currency_code: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub expense_date: Option<NaiveDate>,
    #[serde(default)]
    pub paid_by: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

impl ExpenseForm {
    fn into_draft(self) -> Expense {
        let mut expense =
            Expense::draft(self.id, self.employee_id, self.description, self.amount, self.currency_code);
        expense.category = self.category;
        expense.expense_date = self.expense_date;
        expense.paid_by = self.paid_by;
        expense.remarks = self.remarks;
        expense
    }
}

/// Saves the expense as a draft and submits it under the latest revision of
/// `rule_id`.
pub fn run(file: &Path, rule_id: &str) -> CommandResult {
    let config = match load_config("submit") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let form: ExpenseForm = match read_json("submit", file) {
        Ok(form) => form,
        Err(failure) => return failure,
    };
    let runtime = match runtime("submit") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let service = match open_service("submit", &config).await {
            Ok(service) => service,
            Err(failure) => return failure,
        };
        let context = audit_context(&format!("employee:{}", form.employee_id));
        let draft = form.into_draft();
        let expense_id = draft.id.clone();

        let submitted = match service.save_draft(draft, &context).await {
            Ok(_) => {
                service.submit_expense(&expense_id, &RuleId(rule_id.to_string()), &context).await
            }
            Err(error) => Err(error),
        };
        let result = match submitted {
            Ok(submission) => CommandResult::success_with_data(
                "submit",
                format!(
                    "expense `{}` is {}",
                    submission.expense.id,
                    submission.expense.status.as_str()
                ),
                &submission,
            ),
            Err(error) => {
                CommandResult::from_application_error("submit", error, &context.correlation_id)
            }
        };
        service.store().pool().close().await;
        result
    })
}
