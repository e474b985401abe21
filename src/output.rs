use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::migrate::SchemaIssue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
}

/// Print any serializable value as a single JSON line on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn print_issues(issues: &[SchemaIssue]) {
    if issues.is_empty() {
        println!("{} schema matches", " ok ".green());
        return;
    }
    for issue in issues {
        let tag = match issue {
            SchemaIssue::WrongColumnType { .. } => " ERR".red().bold().to_string(),
            SchemaIssue::MissingTable { .. } | SchemaIssue::MissingColumn { .. } => {
                "warn".yellow().to_string()
            }
        };
        println!("{tag}  {issue}");
    }
}

/// Render epoch milliseconds as a UTC timestamp.
pub fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}
