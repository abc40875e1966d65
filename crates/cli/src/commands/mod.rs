pub mod config;
pub mod decide;
pub mod doctor;
pub mod evaluate;
pub mod migrate;
pub mod queue;
pub mod rule;
pub mod submit;

use std::fs;
use std::path::Path;

use anyhow::Context;
use outlay_core::approvals::{ApprovalService, ApprovalSettings};
use outlay_core::audit::{AuditContext, TracingAuditSink};
use outlay_core::config::{AppConfig, LoadOptions};
use outlay_core::errors::{ApplicationError, InterfaceError};
use outlay_db::{connect_with_config, migrations, SqlApprovalStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            correlation_id: None,
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    /// Success payload carrying a serialized result under `data`.
    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: &impl Serialize,
    ) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => {
                let payload = CommandOutcome {
                    command: command.to_string(),
                    status: "ok".to_string(),
                    error_class: None,
                    message: message.into(),
                    correlation_id: None,
                    data: Some(data),
                };
                Self { exit_code: 0, output: serialize_payload(payload) }
            }
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            correlation_id: None,
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub fn failure_with_data(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        data: &impl Serialize,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            correlation_id: None,
            data: serde_json::to_value(data).ok(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Failure payload for a service error, carrying the user-safe message and
    /// the correlation id of the request.
    pub fn from_application_error(
        command: &str,
        error: ApplicationError,
        correlation_id: &str,
    ) -> Self {
        let detail = error.to_string();
        let interface = error.into_interface(correlation_id);
        let (error_class, exit_code) = match interface {
            InterfaceError::BadRequest { .. } => ("bad_request", 7),
            InterfaceError::NotFound { .. } => ("not_found", 8),
            InterfaceError::Conflict { .. } => ("conflict", 9),
            InterfaceError::ServiceUnavailable { .. } => ("service_unavailable", 4),
            InterfaceError::Internal { .. } => ("internal", 1),
        };
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: format!("{} ({detail})", interface.user_message()),
            correlation_id: Some(interface.correlation_id().to_string()),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub(crate) fn runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

pub(crate) fn read_json<T: DeserializeOwned>(command: &str, path: &Path) -> Result<T, CommandResult> {
    let parsed = fs::read_to_string(path)
        .with_context(|| format!("failed to read `{}`", path.display()))
        .and_then(|raw| {
            serde_json::from_str::<T>(&raw)
                .with_context(|| format!("`{}` is not a valid document", path.display()))
        });
    parsed.map_err(|error| CommandResult::failure(command, "input", format!("{error:#}"), 6))
}

pub(crate) type CliService = ApprovalService<SqlApprovalStore, TracingAuditSink>;

/// Connects to the configured database, applies pending migrations and wires
/// the approval service with a tracing audit sink.
pub(crate) async fn open_service(
    command: &str,
    config: &AppConfig,
) -> Result<CliService, CommandResult> {
    let pool = connect_with_config(&config.database).await.map_err(|error| {
        CommandResult::failure(command, "db_connectivity", error.to_string(), 4)
    })?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| CommandResult::failure(command, "migration", error.to_string(), 5))?;

    Ok(ApprovalService::new(
        SqlApprovalStore::new(pool),
        TracingAuditSink,
        ApprovalSettings::from(&config.approvals),
    ))
}

pub(crate) fn audit_context(actor: &str) -> AuditContext {
    AuditContext::new(None, Uuid::new_v4().to_string(), actor)
}
