//! Diagnostic records, the per-pass map and the published store.
//!
//! A validation pass never edits what the editor shows directly. It fills a
//! [`DiagnosticMap`]: for every file it touches, the source kinds it re-checked
//! (cleared) and the records it found. At the end of the pass the map is merged
//! into [`PublishedDiagnostics`], which answers with the complete current set of
//! every touched file, ready to be sent to the editor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Zero-based line and character.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TextPosition {
    pub line: u32,
    pub character: u32,
}

impl TextPosition {
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub start: TextPosition,
    pub end: TextPosition,
}

impl TextRange {
    pub const ZERO: TextRange = TextRange {
        start: TextPosition::new(0, 0),
        end: TextPosition::new(0, 0),
    };

    pub const fn new(start_line: u32, start_char: u32, end_line: u32, end_char: u32) -> Self {
        Self {
            start: TextPosition::new(start_line, start_char),
            end: TextPosition::new(end_line, end_char),
        }
    }

    pub const fn point(line: u32, character: u32) -> Self {
        Self::new(line, character, line, character)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

/// Which check produced a diagnostic.
///
/// Published as the diagnostic `source`, and used to scope clearing: re-checking
/// the logic never removes what the model validation reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Root,
    Model,
    Logic,
    Grammar,
    Sample,
    Internal,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Root,
        SourceKind::Model,
        SourceKind::Logic,
        SourceKind::Grammar,
        SourceKind::Sample,
        SourceKind::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Root => "root",
            SourceKind::Model => "model",
            SourceKind::Logic => "logic",
            SourceKind::Grammar => "grammar",
            SourceKind::Sample => "sample",
            SourceKind::Internal => "internal",
        }
    }

    pub fn parse(tag: &str) -> Option<SourceKind> {
        SourceKind::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedLocation {
    pub file: PathBuf,
    pub range: TextRange,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub range: TextRange,
    pub message: String,
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<RelatedLocation>,
}

impl DiagnosticRecord {
    pub fn new(
        severity: Severity,
        kind: SourceKind,
        range: TextRange,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            range,
            message: message.into(),
            kind,
            related: None,
        }
    }

    pub fn error(kind: SourceKind, range: TextRange, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, range, message)
    }

    pub fn warning(kind: SourceKind, range: TextRange, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, range, message)
    }

    pub fn with_related(mut self, related: RelatedLocation) -> Self {
        self.related = Some(related);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Default, Clone)]
struct FileDelta {
    cleared: BTreeSet<SourceKind>,
    pushed: Vec<DiagnosticRecord>,
}

/// What one validation pass found, per file.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticMap {
    files: BTreeMap<PathBuf, FileDelta>,
}

impl DiagnosticMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` as re-checked for `file`, dropping any record of that kind
    /// pushed earlier in this pass. Other kinds are left alone.
    pub fn clear(&mut self, file: &Path, kind: SourceKind) {
        let delta = self.files.entry(file.to_path_buf()).or_default();
        delta.cleared.insert(kind);
        delta.pushed.retain(|record| record.kind != kind);
    }

    pub fn clear_all<'a, I>(&mut self, files: I, kind: SourceKind)
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        for file in files {
            self.clear(file, kind);
        }
    }

    pub fn push(&mut self, file: &Path, record: DiagnosticRecord) {
        self.files
            .entry(file.to_path_buf())
            .or_default()
            .pushed
            .push(record);
    }

    /// Records pushed for `file` during this pass.
    pub fn pushed(&self, file: &Path) -> &[DiagnosticRecord] {
        self.files
            .get(file)
            .map(|delta| delta.pushed.as_slice())
            .unwrap_or(&[])
    }

    pub fn was_cleared(&self, file: &Path, kind: SourceKind) -> bool {
        self.files
            .get(file)
            .is_some_and(|delta| delta.cleared.contains(&kind))
    }

    pub fn touched(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Whether this pass pushed an error of `kind` anywhere.
    pub fn has_errors(&self, kind: SourceKind) -> bool {
        self.files
            .values()
            .flat_map(|delta| delta.pushed.iter())
            .any(|record| record.kind == kind && record.is_error())
    }
}

/// The diagnostics currently shown in the editor, per file.
#[derive(Debug, Default, Clone)]
pub struct PublishedDiagnostics {
    files: BTreeMap<PathBuf, Vec<DiagnosticRecord>>,
}

impl PublishedDiagnostics {
    /// Apply a pass map and return the complete set of every file it touched,
    /// empty sets included so the editor drops stale markers.
    pub fn merge(&mut self, map: DiagnosticMap) -> Vec<(PathBuf, Vec<DiagnosticRecord>)> {
        let mut touched = Vec::with_capacity(map.files.len());
        for (file, delta) in map.files {
            let mut current = self.files.remove(&file).unwrap_or_default();
            current.retain(|record| !delta.cleared.contains(&record.kind));
            current.extend(delta.pushed);
            if !current.is_empty() {
                self.files.insert(file.clone(), current.clone());
            }
            touched.push((file, current));
        }
        touched
    }

    pub fn get(&self, file: &Path) -> &[DiagnosticRecord] {
        self.files.get(file).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_kind(&self, file: &Path, kind: SourceKind) -> bool {
        self.get(file).iter().any(|record| record.kind == kind)
    }

    /// Files under `root` currently showing at least one record of `kind`.
    /// Files under any of `other_roots` nested inside `root` belong to those
    /// projects and are left out.
    pub fn files_with_kind(
        &self,
        root: &Path,
        kind: SourceKind,
        other_roots: &[PathBuf],
    ) -> Vec<PathBuf> {
        let nested: Vec<&PathBuf> = other_roots
            .iter()
            .filter(|other| other.as_path() != root && other.starts_with(root))
            .collect();
        self.files
            .iter()
            .filter(|(file, records)| {
                file.starts_with(root)
                    && !nested.iter().any(|inner| file.starts_with(inner))
                    && records.iter().any(|record| record.kind == kind)
            })
            .map(|(file, _)| file.clone())
            .collect()
    }

    /// Forget everything under `root`, returning the files that had diagnostics.
    pub fn remove_under(&mut self, root: &Path) -> Vec<PathBuf> {
        let files: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|file| file.starts_with(root))
            .cloned()
            .collect();
        for file in &files {
            self.files.remove(file);
        }
        files
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &[DiagnosticRecord])> {
        self.files
            .iter()
            .map(|(file, records)| (file.as_path(), records.as_slice()))
    }

    pub fn error_count(&self) -> usize {
        self.files
            .values()
            .flatten()
            .filter(|record| record.is_error())
            .count()
    }
}
