//! Output formatting: `table` (human-readable, aligned columns) or `json`
//! (machine-readable).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_str_arg(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        }
    }
}

/// Render a fixed-width table row: `label` (bold, left-padded to 18) + value.
pub fn field(label: &str, value: impl std::fmt::Display) {
    use colored::Colorize;
    println!("{} {}", format!("{label:<18}").bold(), value);
}

pub fn render_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
