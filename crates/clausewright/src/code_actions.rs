//! Quick fixes.
//!
//! A grammar that references a variable the template model does not declare
//! fails with `Unknown property <name>`. The fix declares the property as a
//! string field right before the closing line of the template model.

use clausewright_core::{DeclarationSite, SourceKind};
use std::collections::HashMap;
use tower_lsp::lsp_types::*;

pub const UNKNOWN_PROPERTY_PREFIX: &str = "Unknown property ";

/// Variable name of an unknown-property grammar error, if `diagnostic` is one.
pub fn unknown_property(diagnostic: &Diagnostic) -> Option<&str> {
    if diagnostic.severity != Some(DiagnosticSeverity::ERROR)
        || diagnostic.source.as_deref() != Some(SourceKind::Grammar.as_str())
    {
        return None;
    }
    let name = diagnostic
        .message
        .strip_prefix(UNKNOWN_PROPERTY_PREFIX)?
        .split(|c: char| c.is_whitespace() || c == '.' || c == '\'' || c == '`' || c == '"')
        .find(|part| !part.is_empty())?;
    name.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        .then_some(name)
}

/// "Add variable" fixes for the diagnostics of a code action request.
pub fn add_variable_actions(
    site: &DeclarationSite,
    diagnostics: &[Diagnostic],
) -> Vec<CodeActionOrCommand> {
    let Ok(model_uri) = Url::from_file_path(&site.file) else {
        return Vec::new();
    };

    diagnostics
        .iter()
        .filter_map(|diagnostic| {
            let name = unknown_property(diagnostic)?;
            let insert_at = Position {
                line: site.range.end.line,
                character: 0,
            };
            let edit = TextEdit {
                range: Range {
                    start: insert_at,
                    end: insert_at,
                },
                new_text: format!("  o String {name}\n"),
            };

            let mut changes = HashMap::new();
            changes.insert(model_uri.clone(), vec![edit]);

            Some(CodeActionOrCommand::CodeAction(CodeAction {
                title: format!("Add variable `{name}` to the template model"),
                kind: Some(CodeActionKind::QUICKFIX),
                diagnostics: Some(vec![diagnostic.clone()]),
                edit: Some(WorkspaceEdit {
                    changes: Some(changes),
                    document_changes: None,
                    change_annotations: None,
                }),
                is_preferred: Some(true),
                ..Default::default()
            }))
        })
        .collect()
}
