use std::path::Path;

use outlay_core::approvals::{evaluate, validate};
use outlay_core::domain::rule::{ApproverId, RuleDefinition};
use outlay_core::ledger::ApprovalLedger;

use crate::commands::{read_json, CommandResult};

/// Evaluates a ledger document against a rule document offline.
pub fn run(rule_file: &Path, ledger_file: &Path) -> CommandResult {
    let rule: RuleDefinition = match read_json("evaluate", rule_file) {
        Ok(rule) => rule,
        Err(failure) => return failure,
    };
    let ledger: ApprovalLedger = match read_json("evaluate", ledger_file) {
        Ok(ledger) => ledger,
        Err(failure) => return failure,
    };

    if let Err(error) = validate(&rule) {
        return CommandResult::failure_with_data(
            "evaluate",
            "validation",
            error.to_string(),
            &error,
            7,
        );
    }

    if !ledger.is_seeded_from(&rule) {
        return CommandResult::failure(
            "evaluate",
            "ledger_mismatch",
            format!(
                "ledger was seeded from rule `{}` revision {}, not `{}` revision {}",
                ledger.rule_id, ledger.rule_revision, rule.id, rule.revision
            ),
            7,
        );
    }

    // The document must carry exactly the entries a fresh ledger would, in order.
    let expected = ApprovalLedger::create(&rule, ledger.expense_id.clone());
    let expected_ids: Vec<&ApproverId> =
        expected.entries.iter().map(|entry| &entry.approver_id).collect();
    let actual_ids: Vec<&ApproverId> =
        ledger.entries.iter().map(|entry| &entry.approver_id).collect();
    if actual_ids != expected_ids {
        return CommandResult::failure(
            "evaluate",
            "ledger_mismatch",
            format!(
                "ledger entries [{}] do not match the approvers of rule `{}` [{}]",
                join_ids(&actual_ids),
                rule.id,
                join_ids(&expected_ids)
            ),
            7,
        );
    }

    let result = evaluate(&rule, &ledger);
    CommandResult::success_with_data(
        "evaluate",
        format!(
            "expense `{}` is {} ({} of {} approved, {}%)",
            ledger.expense_id,
            result.status.as_str(),
            result.approved_count,
            result.total_count,
            result.percentage
        ),
        &result,
    )
}

fn join_ids(ids: &[&ApproverId]) -> String {
    ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
}
