//! clausewright library - editing feedback for contract template projects
//!
//! This library exposes the validation machinery behind the `clausewright`
//! language server and checker for testing and embedding purposes.

pub mod cache;
pub mod code_actions;
pub mod config;
pub mod lsp;
pub mod notifier;
pub mod output;
pub mod pipeline;
pub mod toolchain;
pub mod validator;

pub use cache::{ProjectCache, ProjectCacheEntry};
pub use config::{Config, load_config, load_config_or_default};
pub use notifier::{ChangeNotifier, DiagnosticSink, RecordingSink};
pub use pipeline::{ChangeSet, PassReport, Stage, StageOutcome};
pub use validator::Validator;
