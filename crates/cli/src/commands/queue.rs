use outlay_core::domain::rule::ApproverId;

use crate::commands::{audit_context, load_config, open_service, runtime, CommandResult};

/// Lists expenses waiting on a decision from `approver_id`.
pub fn run(approver_id: &str) -> CommandResult {
    let config = match load_config("queue") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("queue") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let service = match open_service("queue", &config).await {
            Ok(service) => service,
            Err(failure) => return failure,
        };
        let context = audit_context(&format!("approver:{approver_id}"));
        let approver = ApproverId(approver_id.to_string());

        let result = match service.approval_queue(&approver, &context).await {
            Ok(queue) => CommandResult::success_with_data(
                "queue",
                format!("{} expense(s) waiting on `{approver_id}`", queue.len()),
                &queue,
            ),
            Err(error) => {
                CommandResult::from_application_error("queue", error, &context.correlation_id)
            }
        };
        service.store().pool().close().await;
        result
    })
}
