//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No workload identity. Pass --workload or run `edgectl config set --as <name>`.")]
    NoIdentity,

    #[error("{message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        hint: Option<String>,
        retryable: bool,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        for line in hint_lines(cli_err) {
            eprintln!("\n{}", line.yellow());
        }
    }
}

fn hint_lines(err: &CliError) -> Vec<String> {
    match err {
        CliError::Api {
            status,
            hint,
            retryable,
            ..
        } => {
            let mut lines = Vec::new();
            if let Some(hint) = hint {
                lines.push(format!("Hint: {hint}"));
            } else if *status == 401 {
                lines.push("Hint: check the workload name you are calling as.".to_string());
            }
            if *retryable {
                lines.push("The operation was rolled back and can be retried.".to_string());
            }
            lines
        }
        CliError::Network(_) => {
            vec!["Hint: is edgeward-control running? Check --api-url.".to_string()]
        }
        _ => Vec::new(),
    }
}
