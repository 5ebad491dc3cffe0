//! clausewright-core - building blocks for validating contract template projects
//!
//! A template project is a directory holding a marker `package.json`, data-model
//! schema files, logic files, a grammar and sample documents. This crate holds
//! everything that does not depend on the editor protocol:
//!
//! - [`root`]: finding the project a file belongs to
//! - [`conventions`]: classifying and discovering project files
//! - [`diagnostics`]: per-pass diagnostic maps and the published store they merge into
//! - [`services`]: the contracts of the external model, logic and grammar collaborators
//! - [`location`]: turning collaborator error locations into editor ranges
//! - [`overlay`]: reading edited buffers before falling back to disk
//!
//! ```
//! use clausewright_core::diagnostics::{DiagnosticMap, DiagnosticRecord, PublishedDiagnostics, SourceKind, TextRange};
//! use std::path::Path;
//!
//! let file = Path::new("/project/model/model.cto");
//! let mut map = DiagnosticMap::new();
//! map.clear(file, SourceKind::Model);
//! map.push(file, DiagnosticRecord::error(SourceKind::Model, TextRange::ZERO, "bad namespace"));
//!
//! let mut published = PublishedDiagnostics::default();
//! let touched = published.merge(map);
//! assert_eq!(touched[0].1.len(), 1);
//! ```

pub mod conventions;
pub mod diagnostics;
pub mod location;
pub mod overlay;
pub mod root;
pub mod services;

pub use conventions::{ConventionMatcher, Conventions, FileKind};
pub use diagnostics::{
    DiagnosticMap, DiagnosticRecord, PublishedDiagnostics, RelatedLocation, Severity, SourceKind,
    TextPosition, TextRange,
};
pub use location::{VerboseLocationAdapter, attribute_file, error_range};
pub use overlay::{FileOverlay, read_file_with_overlay};
pub use root::{ProjectRoot, RootResolution, RootResolver, TemplateKind};
pub use services::{
    CompiledTemplate, DeclarationSite, ErrorSpan, Formula, LogicManager, ModelManager,
    ServiceError, ServiceErrorKind, ServiceFactory, SourceFile, SourcePoint, TemplateBuilder,
};
