//! Publishing diagnostics.
//!
//! Each committed pass hands over the complete current set of every file it
//! touched. Sinks replace, never append: an empty set clears the file.

use async_trait::async_trait;
use clausewright_core::{DiagnosticRecord, Severity};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tower_lsp::Client;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticRelatedInformation, DiagnosticSeverity, Location, Position, Range, Url,
};
use tracing::debug;

#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn publish(&self, file: &Path, diagnostics: &[DiagnosticRecord]);
}

pub struct ChangeNotifier {
    sink: Arc<dyn DiagnosticSink>,
}

impl ChangeNotifier {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink }
    }

    pub async fn publish(&self, touched: Vec<(PathBuf, Vec<DiagnosticRecord>)>) {
        for (file, diagnostics) in touched {
            debug!(file = %file.display(), count = diagnostics.len(), "publishing diagnostics");
            self.sink.publish(&file, &diagnostics).await;
        }
    }
}

fn to_lsp_range(range: clausewright_core::TextRange) -> Range {
    Range {
        start: Position {
            line: range.start.line,
            character: range.start.character,
        },
        end: Position {
            line: range.end.line,
            character: range.end.character,
        },
    }
}

pub fn to_lsp_diagnostic(record: &DiagnosticRecord) -> Diagnostic {
    let related_information = record.related.as_ref().and_then(|related| {
        let uri = Url::from_file_path(&related.file).ok()?;
        Some(vec![DiagnosticRelatedInformation {
            location: Location {
                uri,
                range: to_lsp_range(related.range),
            },
            message: related.message.clone(),
        }])
    });

    Diagnostic {
        range: to_lsp_range(record.range),
        severity: Some(match record.severity {
            Severity::Error => DiagnosticSeverity::ERROR,
            Severity::Warning => DiagnosticSeverity::WARNING,
            Severity::Information => DiagnosticSeverity::INFORMATION,
            Severity::Hint => DiagnosticSeverity::HINT,
        }),
        source: Some(record.kind.as_str().to_owned()),
        message: record.message.clone(),
        related_information,
        ..Default::default()
    }
}

/// Sends diagnostics to the editor.
pub struct ClientSink {
    client: Client,
}

impl ClientSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiagnosticSink for ClientSink {
    async fn publish(&self, file: &Path, diagnostics: &[DiagnosticRecord]) {
        let Ok(uri) = Url::from_file_path(file) else {
            debug!(file = %file.display(), "cannot publish diagnostics for non-absolute path");
            return;
        };
        let diagnostics = diagnostics.iter().map(to_lsp_diagnostic).collect();
        self.client.publish_diagnostics(uri, diagnostics, None).await;
    }
}

/// Keeps what would have been shown, for the CLI and for tests.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    current: BTreeMap<PathBuf, Vec<DiagnosticRecord>>,
    history: Vec<(PathBuf, Vec<DiagnosticRecord>)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What the editor shows for `file` right now.
    pub fn current(&self, file: &Path) -> Vec<DiagnosticRecord> {
        self.state().current.get(file).cloned().unwrap_or_default()
    }

    /// Every non-empty set, per file.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<DiagnosticRecord>> {
        self.state()
            .current
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(file, records)| (file.clone(), records.clone()))
            .collect()
    }

    /// Every publication in order.
    pub fn history(&self) -> Vec<(PathBuf, Vec<DiagnosticRecord>)> {
        self.state().history.clone()
    }

    pub fn publications_for(&self, file: &Path) -> Vec<Vec<DiagnosticRecord>> {
        self.state()
            .history
            .iter()
            .filter(|(published, _)| published == file)
            .map(|(_, records)| records.clone())
            .collect()
    }
}

#[async_trait]
impl DiagnosticSink for RecordingSink {
    async fn publish(&self, file: &Path, diagnostics: &[DiagnosticRecord]) {
        let mut state = self.state();
        state
            .current
            .insert(file.to_path_buf(), diagnostics.to_vec());
        state
            .history
            .push((file.to_path_buf(), diagnostics.to_vec()));
    }
}
