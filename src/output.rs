// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Human-readable tables and messages, or JSON for scripting.

use crate::diagnostics::Diagnostics;
use crate::error::{Error, ErrorClass};
use crate::provider::{DatabaseHandle, NodeHandle};
use crate::state::ServiceRecord;
use serde::Serialize;
use std::time::Instant;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with progress messages
    Normal,
    /// JSON documents for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
    start_time: Instant,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            start_time: Instant::now(),
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Print a progress message (suppressed in json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Print a success message with timing.
    pub fn success(&self, message: &str) {
        match self.mode {
            OutputMode::Normal => println!("{message} ({:.1}s)", self.elapsed_secs()),
            OutputMode::Json => print_json(&JsonEvent {
                event: "success",
                message,
                duration_secs: Some(self.elapsed_secs()),
            }),
        }
    }

    /// Print warnings collected while the command ran.
    pub fn warnings(&self, diag: &Diagnostics) {
        for warning in diag.warnings() {
            match self.mode {
                OutputMode::Normal => eprintln!("warning: {}", warning.message),
                OutputMode::Json => {
                    if let Ok(json) = serde_json::to_string(&JsonEvent {
                        event: "warning",
                        message: &warning.message,
                        duration_secs: None,
                    }) {
                        eprintln!("{json}");
                    }
                }
            }
        }
    }

    /// Print a fatal error, distinguishing operator mistakes from infrastructure trouble.
    pub fn error(&self, error: &Error) {
        let class = error.class();
        let prefix = match class {
            ErrorClass::User => "error",
            ErrorClass::ResourceInUse => "refused",
            ErrorClass::TransientInfra | ErrorClass::FatalInfra => "infrastructure error",
        };
        match self.mode {
            OutputMode::Normal => eprintln!("{prefix}: {error}"),
            OutputMode::Json => {
                let message = error.to_string();
                if let Ok(json) = serde_json::to_string(&JsonEvent {
                    event: prefix,
                    message: &message,
                    duration_secs: Some(self.elapsed_secs()),
                }) {
                    eprintln!("{json}");
                }
            }
        }
    }

    pub fn services(&self, records: &[ServiceRecord]) {
        if self.mode == OutputMode::Json {
            print_json(&records);
            return;
        }
        if records.is_empty() {
            println!("no services");
            return;
        }
        let rows: Vec<[String; 6]> = records.iter().map(service_row).collect();
        print_table(["NAME", "STATUS", "IMAGE", "NODE", "IP", "UPDATED"], &rows);
        for record in records {
            if let Some(error) = &record.last_error {
                let first = error.lines().next().unwrap_or_default();
                println!("\n{}: {}", record.name, first);
            }
        }
    }

    pub fn nodes(&self, nodes: &[NodeHandle]) {
        if self.mode == OutputMode::Json {
            print_json(&nodes);
            return;
        }
        let rows: Vec<[String; 6]> = nodes
            .iter()
            .map(|n| {
                [
                    n.id.to_string(),
                    n.name.clone(),
                    n.status.to_string(),
                    n.ip_address.clone().unwrap_or_else(|| "-".into()),
                    n.size.clone(),
                    n.tags.join(","),
                ]
            })
            .collect();
        print_table(["ID", "NAME", "STATUS", "IP", "SIZE", "TAGS"], &rows);
    }

    pub fn databases(&self, databases: &[DatabaseHandle]) {
        if self.mode == OutputMode::Json {
            print_json(&databases);
            return;
        }
        let rows: Vec<[String; 5]> = databases
            .iter()
            .map(|db| {
                [
                    db.id.to_string(),
                    db.name.clone(),
                    db.engine.clone(),
                    db.status.to_string(),
                    db.size.clone(),
                ]
            })
            .collect();
        print_table(["ID", "NAME", "ENGINE", "STATUS", "SIZE"], &rows);
    }

    /// Print a single value: the raw text, or a JSON object keyed by `key`.
    pub fn value(&self, key: &str, value: &str) {
        match self.mode {
            OutputMode::Normal => println!("{value}"),
            OutputMode::Json => {
                let mut object = serde_json::Map::new();
                object.insert(key.to_string(), value.into());
                print_json(&object);
            }
        }
    }
}

fn service_row(record: &ServiceRecord) -> [String; 6] {
    let node = record.node();
    [
        record.name.to_string(),
        record.status.to_string(),
        record
            .image
            .as_ref()
            .map_or_else(|| record.spec.image.to_string(), ToString::to_string),
        node.map_or_else(|| "-".into(), |n| n.id.to_string()),
        node.and_then(|n| n.ip_address.clone())
            .unwrap_or_else(|| "-".into()),
        record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
    ]
}

/// Left-aligned columns sized to their widest cell.
fn format_table<const N: usize>(headers: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths = headers.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = line(headers.to_vec());
    for row in rows {
        out.push('\n');
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

fn print_table<const N: usize>(headers: [&str; N], rows: &[[String; N]]) {
    println!("{}", format_table(headers, rows));
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    if let Ok(json) = serde_json::to_string_pretty(value) {
        println!("{json}");
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_columns_align() {
        let rows = vec![
            ["web".to_string(), "running".to_string()],
            ["api-blue".to_string(), "failed".to_string()],
        ];
        let table = format_table(["NAME", "STATUS"], &rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "NAME      STATUS");
        assert_eq!(lines[1], "web       running");
        assert_eq!(lines[2], "api-blue  failed");
    }
}
