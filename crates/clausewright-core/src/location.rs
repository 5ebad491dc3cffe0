//! Turning collaborator error locations into editor ranges and files.

use regex::Regex;
use std::path::{Path, PathBuf};

use crate::diagnostics::TextRange;
use crate::services::{ErrorSpan, ServiceError};

/// Editor range for an error.
///
/// Parser spans are converted from 1-based lines. Compiler descriptors of
/// compilation and type errors collapse to their start point when one is known,
/// otherwise span from the top of the file to the end point. Anything else
/// lands on the zero range.
pub fn error_range(error: &ServiceError) -> TextRange {
    let Some(span) = error.span else {
        return TextRange::ZERO;
    };
    match span {
        ErrorSpan::Compiler { start, end } if error.kind.is_compiler() => {
            if start.line > 0 {
                TextRange::point(start.line - 1, start.column)
            } else if end.line > 0 {
                TextRange::new(0, 0, end.line - 1, end.column)
            } else {
                TextRange::ZERO
            }
        }
        ErrorSpan::Parser { start, end } | ErrorSpan::Compiler { start, end } => TextRange::new(
            start.line.saturating_sub(1),
            start.column,
            end.line.saturating_sub(1),
            end.column,
        ),
    }
}

/// Fallback for compilers that only name the offending file inside their
/// verbose output (`... at file logic/logic.ergo line 3 ...`).
#[derive(Debug, Clone)]
pub struct VerboseLocationAdapter {
    pattern: Regex,
}

impl VerboseLocationAdapter {
    pub fn for_extension(extension: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"at file (\S+\.{})\b",
            regex::escape(extension)
        ))?;
        Ok(Self { pattern })
    }

    pub fn file_from_verbose(&self, verbose: &str) -> Option<PathBuf> {
        self.pattern
            .captures(verbose)
            .and_then(|captures| captures.get(1))
            .map(|m| PathBuf::from(m.as_str()))
    }
}

/// Which file a diagnostic for `error` belongs to: the structured location,
/// then the verbose message, then the model file being processed, then `fallback`.
/// Relative paths are resolved against `root`.
pub fn attribute_file(
    error: &ServiceError,
    verbose: Option<&VerboseLocationAdapter>,
    root: &Path,
    fallback: &Path,
) -> PathBuf {
    let from_verbose = || {
        verbose.zip(error.verbose.as_deref())
            .and_then(|(adapter, text)| adapter.file_from_verbose(text))
    };
    let found = error
        .file
        .clone()
        .or_else(from_verbose)
        .or_else(|| error.model_file.clone());
    match found {
        Some(path) if path.is_absolute() => path,
        Some(path) => root.join(path),
        None => fallback.to_path_buf(),
    }
}
