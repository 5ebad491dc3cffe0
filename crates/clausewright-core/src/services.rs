//! Contracts of the external collaborators.
//!
//! The model compiler, the logic compiler and the grammar parser live outside
//! this workspace. The pipeline only sees these traits, so tests can swap in
//! fakes and the binary can plug in a process bridge. Every fallible call
//! returns a [`ServiceError`] tagged with its kind instead of a free-form
//! exception message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::diagnostics::TextRange;
use crate::root::{ProjectRoot, TemplateKind};

/// A 1-based line and a 0-based column, as collaborators report them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePoint {
    pub line: u32,
    pub column: u32,
}

impl SourcePoint {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Where in a file an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ErrorSpan {
    /// Parser location with both ends known.
    Parser { start: SourcePoint, end: SourcePoint },
    /// Compiler descriptor; a line of 0 means that end is unknown.
    Compiler { start: SourcePoint, end: SourcePoint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// Malformed or inconsistent input (bad namespace, unknown type, unknown property).
    Structural,
    /// A remote dependency could not be fetched.
    Connectivity,
    Compilation,
    Type,
    Parse,
    /// The collaborator itself could not be reached or misbehaved.
    Io,
}

impl ServiceErrorKind {
    pub fn is_compiler(self) -> bool {
        matches!(self, ServiceErrorKind::Compilation | ServiceErrorKind::Type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<ErrorSpan>,
    /// Full compiler output, sometimes the only place naming the offending file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<String>,
    /// Model file the collaborator was processing when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_file: Option<PathBuf>,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: None,
            span: None,
            verbose: None,
            model_file: None,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Io, message)
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_span(mut self, span: ErrorSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_verbose(mut self, verbose: impl Into<String>) -> Self {
        self.verbose = Some(verbose.into());
        self
    }

    pub fn with_model_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.model_file = Some(file.into());
        self
    }

    pub fn is_connectivity(&self) -> bool {
        self.kind == ServiceErrorKind::Connectivity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub text: String,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// An expression embedded in the grammar, compiled together with the logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub code: String,
}

/// Where a declaration lives, as 0-based editor coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationSite {
    pub file: PathBuf,
    pub range: TextRange,
}

#[async_trait]
pub trait ModelManager: Send + Sync {
    fn clear_model_files(&mut self);

    /// Parse one schema file and add it. Fails on syntax errors only.
    fn add_model_file(&mut self, file: SourceFile) -> Result<(), ServiceError>;

    fn model_files(&self) -> Vec<SourceFile>;

    /// Fetch externally referenced models, then validate everything.
    /// Fails with [`ServiceErrorKind::Connectivity`] when offline.
    async fn update_external_models(&mut self) -> Result<(), ServiceError>;

    /// Validate using only what is already loaded.
    async fn validate(&mut self) -> Result<(), ServiceError>;

    /// Declaration of the type the grammar binds to, once validated.
    fn template_model(&self) -> Option<DeclarationSite>;
}

#[async_trait]
pub trait LogicManager: Send + Sync {
    /// Add or replace one logic file.
    fn update_logic(&mut self, file: SourceFile);

    fn remove_logic(&mut self, path: &Path);

    fn logic_files(&self) -> Vec<PathBuf>;

    fn register_formulas(&mut self, formulas: Vec<Formula>);

    /// No logic files and no formulas: nothing to compile.
    fn is_empty(&self) -> bool;

    async fn compile(&mut self, models: &dyn ModelManager) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait CompiledTemplate: Send + Sync {
    fn identifier(&self) -> String;

    fn formulas(&self) -> Vec<Formula>;

    /// Parse a sample document into the template's data model.
    async fn parse_sample(&self, sample: SourceFile) -> Result<serde_json::Value, ServiceError>;
}

#[async_trait]
pub trait TemplateBuilder: Send + Sync {
    async fn build(
        &self,
        kind: TemplateKind,
        grammar: SourceFile,
        models: &dyn ModelManager,
    ) -> Result<Arc<dyn CompiledTemplate>, ServiceError>;
}

/// Creates the collaborators for a project.
pub trait ServiceFactory: Send + Sync {
    fn model_manager(&self, root: &ProjectRoot) -> Box<dyn ModelManager>;
    fn logic_manager(&self, root: &ProjectRoot) -> Box<dyn LogicManager>;
    fn template_builder(&self, root: &ProjectRoot) -> Arc<dyn TemplateBuilder>;
}
