pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use outlay_core::ledger::Verdict;

#[derive(Debug, Parser)]
#[command(
    name = "outlay",
    about = "Outlay expense approval CLI",
    long_about = "Inspect configuration, run migrations, validate approval rules and drive expense approvals.",
    after_help = "Examples:\n  outlay doctor --json\n  outlay rule validate --file rule.json\n  outlay evaluate --rule rule.json --ledger ledger.json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Validate or store approval rules")]
    Rule(RuleCommand),
    #[command(about = "Evaluate a ledger document against a rule document offline")]
    Evaluate {
        #[arg(long, help = "Path to a rule definition JSON document")]
        rule: PathBuf,
        #[arg(long, help = "Path to an approval ledger JSON document")]
        ledger: PathBuf,
    },
    #[command(about = "Save an expense and submit it for approval")]
    Submit {
        #[arg(long, help = "Path to an expense JSON document")]
        file: PathBuf,
        #[arg(long, help = "Id of the approval rule to apply")]
        rule: String,
    },
    #[command(about = "Record an approver's decision on a waiting expense")]
    Decide {
        #[arg(long)]
        expense: String,
        #[arg(long)]
        approver: String,
        #[arg(long, value_enum)]
        verdict: VerdictArg,
    },
    #[command(about = "List expenses waiting on an approver")]
    Queue {
        #[arg(long)]
        approver: String,
    },
}

#[derive(Debug, Subcommand)]
enum RuleCommand {
    #[command(about = "Check an approval-rule form without storing it")]
    Validate {
        #[arg(long, help = "Path to an approval-rule form JSON document")]
        file: PathBuf,
    },
    #[command(about = "Store an approval-rule form as the next revision")]
    Define {
        #[arg(long, help = "Path to an approval-rule form JSON document")]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VerdictArg {
    Approve,
    Reject,
}

impl From<VerdictArg> for Verdict {
    fn from(value: VerdictArg) -> Self {
        match value {
            VerdictArg::Approve => Verdict::Approved,
            VerdictArg::Reject => Verdict::Rejected,
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Rule(RuleCommand::Validate { file }) => commands::rule::validate(&file),
        Command::Rule(RuleCommand::Define { file }) => commands::rule::define(&file),
        Command::Evaluate { rule, ledger } => commands::evaluate::run(&rule, &ledger),
        Command::Submit { file, rule } => commands::submit::run(&file, &rule),
        Command::Decide { expense, approver, verdict } => {
            commands::decide::run(&expense, &approver, verdict.into())
        }
        Command::Queue { approver } => commands::queue::run(&approver),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
