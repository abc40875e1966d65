use std::env;
use std::fs;
use std::path::Path;

use outlay_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

/// (key path, environment variable) for every reported setting.
const FIELDS: &[(&str, &str)] = &[
    ("database.url", "OUTLAY_DATABASE_URL"),
    ("database.max_connections", "OUTLAY_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "OUTLAY_DATABASE_TIMEOUT_SECS"),
    (
        "approvals.default_min_approval_percentage",
        "OUTLAY_APPROVALS_DEFAULT_MIN_APPROVAL_PERCENTAGE",
    ),
    ("approvals.max_conflict_retries", "OUTLAY_APPROVALS_MAX_CONFLICT_RETRIES"),
    ("logging.level", "OUTLAY_LOGGING_LEVEL"),
    ("logging.format", "OUTLAY_LOGGING_FORMAT"),
];

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_key) in FIELDS {
        let source =
            field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value_of(&config, key_path), source));
    }

    lines.join("\n")
}

fn value_of(config: &AppConfig, key_path: &str) -> String {
    match key_path {
        "database.url" => config.database.url.clone(),
        "database.max_connections" => config.database.max_connections.to_string(),
        "database.timeout_secs" => config.database.timeout_secs.to_string(),
        "approvals.default_min_approval_percentage" => {
            config.approvals.default_min_approval_percentage.to_string()
        }
        "approvals.max_conflict_retries" => config.approvals.max_conflict_retries.to_string(),
        "logging.level" => config.logging.level.clone(),
        "logging.format" => format!("{:?}", config.logging.format),
        _ => "<unknown>".to_string(),
    }
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn nested_key_paths_are_resolved() {
        let doc: toml::Value = "[approvals]\nmax_conflict_retries = 2\n".parse().expect("toml");
        assert!(contains_path(&doc, "approvals.max_conflict_retries"));
        assert!(!contains_path(&doc, "approvals.default_min_approval_percentage"));
        assert!(!contains_path(&doc, "logging.level"));
    }
}
