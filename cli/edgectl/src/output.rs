//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

const CLI_SCHEMA_VERSION: &str = "edgeward.cli.v1";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    Json,
}

/// Print rows as a table or a JSON array.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a single item as JSON.
pub fn print_single<T: Serialize>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow().bold(), message);
}

/// Follow-up command suggested after a write.
#[derive(Debug, Serialize)]
pub struct NextStep {
    pub label: &'static str,
    pub cmd: String,
}

/// Result of a write: a message plus the resource, with follow-ups.
pub fn print_receipt<T: Serialize>(
    format: OutputFormat,
    message: &str,
    kind: &str,
    resource: &T,
    next: &[NextStep],
) {
    match format {
        OutputFormat::Table => {
            print_success(message);
            for step in next {
                print_info(&format!("{}: {}", step.label, step.cmd));
            }
        }
        OutputFormat::Json => print_single(&receipt_value(kind, resource, next)),
    }
}

fn receipt_value<T: Serialize>(kind: &str, resource: &T, next: &[NextStep]) -> serde_json::Value {
    serde_json::json!({
        "receipt": {
            "kind": kind,
            "resource": serde_json::to_value(resource).unwrap_or_else(|_| serde_json::json!({})),
            "next": serde_json::to_value(next).unwrap_or_else(|_| serde_json::json!([])),
        }
    })
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    let value = serde_json::to_value(data).unwrap_or_else(|_| serde_json::json!({}));
    let wrapped = serde_json::json!({
        "schemaVersion": CLI_SCHEMA_VERSION,
        "data": value
    });
    serde_json::to_string_pretty(&sort_json_value(wrapped)).unwrap_or_else(|_| fallback.to_string())
}

fn sort_json_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.into_iter().map(sort_json_value).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut pairs: Vec<_> = entries.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            let mut mapped = serde_json::Map::new();
            for (key, value) in pairs {
                mapped.insert(key, sort_json_value(value));
            }
            serde_json::Value::Object(mapped)
        }
        other => other,
    }
}

/// Render an optional value for a table cell.
pub fn display_option<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}
