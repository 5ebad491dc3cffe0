//! Output formatting for `clausewright check`

use clausewright_core::{DiagnosticRecord, Severity};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::pipeline::{PassReport, StageOutcome};

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Everything one check run found.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<PassReport>,
    pub diagnostics: BTreeMap<PathBuf, Vec<DiagnosticRecord>>,
}

impl CheckReport {
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .values()
            .flatten()
            .filter(|record| record.is_error())
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .values()
            .flatten()
            .filter(|record| record.severity == Severity::Warning)
            .count()
    }
}

/// Render a check report in the specified format
pub fn render_report(report: &CheckReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => render_text(report),
        OutputFormat::Json => render_json(report),
    }
}

fn display_path<'a>(root: &Path, file: &'a Path) -> std::borrow::Cow<'a, str> {
    file.strip_prefix(root).unwrap_or(file).to_string_lossy()
}

fn stage_label(outcome: StageOutcome) -> String {
    match outcome {
        StageOutcome::Passed => "passed".green().to_string(),
        StageOutcome::Failed => "failed".red().bold().to_string(),
        StageOutcome::Skipped => "skipped".dimmed().to_string(),
    }
}

fn render_text(report: &CheckReport) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str(&format!(
        "{} {}\n",
        "##".bold(),
        report.root.display().cyan().bold()
    ));

    if let Some(stages) = &report.stages {
        output.push_str(&format!(
            "  model {}  logic {}  grammar {}  sample {}\n",
            stage_label(stages.model),
            stage_label(stages.logic),
            stage_label(stages.grammar),
            stage_label(stages.sample),
        ));
        if stages.offline {
            output.push_str(&format!(
                "  {}\n",
                "external models unavailable, validated offline".yellow()
            ));
        }
    }
    output.push('\n');

    for (file, records) in &report.diagnostics {
        for record in records {
            let severity = match record.severity {
                Severity::Error => "error".red().bold().to_string(),
                Severity::Warning => "warning".yellow().bold().to_string(),
                Severity::Information => "info".blue().to_string(),
                Severity::Hint => "hint".dimmed().to_string(),
            };
            output.push_str(&format!(
                "{}[{}] {}:{}:{} {}\n",
                severity,
                record.kind.as_str().dimmed(),
                display_path(&report.root, file),
                record.range.start.line + 1,
                record.range.start.character + 1,
                record.message
            ));
        }
    }

    let errors = report.error_count();
    let warnings = report.warning_count();
    if errors == 0 && warnings == 0 {
        output.push_str(&format!("{} No problems found\n", "✓".green().bold()));
    } else {
        output.push_str(&format!(
            "\n{} {} error(s), {} warning(s)\n",
            if errors > 0 {
                "!".red().bold().to_string()
            } else {
                "?".yellow().bold().to_string()
            },
            errors,
            warnings
        ));
    }

    output
}

fn render_json(report: &CheckReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}
