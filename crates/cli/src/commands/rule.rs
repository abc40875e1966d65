use std::path::Path;

use outlay_core::domain::rule::RuleDraft;

use crate::commands::{audit_context, load_config, open_service, read_json, runtime, CommandResult};

/// Checks an approval-rule form document without touching the database.
pub fn validate(file: &Path) -> CommandResult {
    let config = match load_config("rule.validate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let draft: RuleDraft = match read_json("rule.validate", file) {
        Ok(draft) => draft,
        Err(failure) => return failure,
    };

    match draft.into_rule(config.approvals.default_min_approval_percentage) {
        Ok(rule) => CommandResult::success_with_data(
            "rule.validate",
            format!(
                "rule `{}` is valid with {} approver(s)",
                rule.id,
                rule.effective_approvers().count()
            ),
            &rule,
        ),
        Err(error) => CommandResult::failure_with_data(
            "rule.validate",
            "validation",
            error.to_string(),
            &error,
            7,
        ),
    }
}

/// Stores an approval-rule form as the next revision of its rule.
pub fn define(file: &Path) -> CommandResult {
    let config = match load_config("rule.define") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let draft: RuleDraft = match read_json("rule.define", file) {
        Ok(draft) => draft,
        Err(failure) => return failure,
    };
    let runtime = match runtime("rule.define") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let service = match open_service("rule.define", &config).await {
            Ok(service) => service,
            Err(failure) => return failure,
        };
        let context = audit_context("cli:rule.define");
        let result = match service.define_rule_from_draft(draft, &context).await {
            Ok(rule) => CommandResult::success_with_data(
                "rule.define",
                format!("stored rule `{}` revision {}", rule.id, rule.revision),
                &rule,
            ),
            Err(error) => {
                CommandResult::from_application_error("rule.define", error, &context.correlation_id)
            }
        };
        service.store().pool().close().await;
        result
    })
}
