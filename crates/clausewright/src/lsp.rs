//! Language server over stdio.
//!
//! Document events update the validator's overlay and queue a pass for the
//! affected project; diagnostics arrive asynchronously through [`ClientSink`]
//! once the pass commits. Handlers never wait for a pass to finish.

use clausewright_core::Conventions;
use eyre::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tower_lsp::jsonrpc::{Error as LspError, Result as LspResult};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::{debug, info, warn};

use crate::code_actions::add_variable_actions;
use crate::config::{Config, default_config_path, load_config_or_default};
use crate::notifier::ClientSink;
use crate::toolchain::ToolchainServices;
use crate::validator::Validator;

pub const PARSE_SAMPLE_COMMAND: &str = "clausewright.parseSample";
pub const REVALIDATE_COMMAND: &str = "clausewright.revalidate";

/// Run the language server over stdio.
///
/// `config_path` overrides the config file looked up under the workspace root
/// the editor announces.
pub async fn run(root: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(|client| Backend {
        client,
        root,
        config_path,
        validator: OnceLock::new(),
        watch_files: AtomicBool::new(false),
    });
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}

struct Backend {
    client: Client,
    /// Workspace root given on the command line, preferred over the editor's.
    root: Option<PathBuf>,
    config_path: Option<PathBuf>,
    /// Built during `initialize`, once the configuration is known.
    validator: OnceLock<Validator>,
    /// The client can watch files for us once asked to.
    watch_files: AtomicBool,
}

fn file_path(uri: &Url) -> Option<PathBuf> {
    uri.to_file_path().ok()
}

#[allow(deprecated)]
fn workspace_root(params: &InitializeParams) -> Option<PathBuf> {
    params
        .workspace_folders
        .as_ref()
        .and_then(|folders| folders.first())
        .and_then(|folder| file_path(&folder.uri))
        .or_else(|| params.root_uri.as_ref().and_then(file_path))
}

const WATCHED_FILES_REGISTRATION: &str = "clausewright-watched-files";

/// Ask the client to report changes to project files, open or not.
fn watched_files_registration(conventions: &Conventions) -> Registration {
    let options = DidChangeWatchedFilesRegistrationOptions {
        watchers: conventions
            .watch_globs()
            .into_iter()
            .map(|glob| FileSystemWatcher {
                glob_pattern: GlobPattern::String(glob),
                kind: None,
            })
            .collect(),
    };
    Registration {
        id: WATCHED_FILES_REGISTRATION.to_owned(),
        method: "workspace/didChangeWatchedFiles".to_owned(),
        register_options: serde_json::to_value(options).ok(),
    }
}

fn uri_argument(arguments: &[Value]) -> Option<PathBuf> {
    let uri = arguments.first()?.as_str()?;
    file_path(&Url::parse(uri).ok()?)
}

impl Backend {
    fn validator(&self) -> Option<&Validator> {
        self.validator.get()
    }

    /// The validator, when `path` is a file a template project could care about.
    fn validator_for(&self, path: &Path) -> Option<&Validator> {
        let validator = self.validator()?;
        validator.matcher().is_candidate(path).then_some(validator)
    }

    fn load_config(&self, params: &InitializeParams) -> Config {
        let root = self.root.clone().or_else(|| workspace_root(params));
        let path = self
            .config_path
            .clone()
            .or_else(|| root.as_deref().map(default_config_path));
        let mut config = match path {
            Some(path) => load_config_or_default(&path),
            None => Config::default(),
        };
        if let Some(options) = params.initialization_options.clone()
            && let Err(e) = config.merge_json(options)
        {
            warn!("ignoring initialization options: {e:#}");
        }
        config
    }

    async fn parse_sample(&self, arguments: &[Value]) -> LspResult<Option<Value>> {
        let (Some(validator), Some(path)) = (self.validator(), uri_argument(arguments)) else {
            return Err(LspError::invalid_params("expected a file URI argument"));
        };
        Ok(Some(validator.last_parse(&path).await.unwrap_or(Value::Null)))
    }

    async fn revalidate(&self, arguments: &[Value]) -> LspResult<Option<Value>> {
        let (Some(validator), Some(path)) = (self.validator(), uri_argument(arguments)) else {
            return Err(LspError::invalid_params("expected a file URI argument"));
        };
        let root = validator.revalidate(&path).await;
        Ok(Some(Value::Bool(root.is_some())))
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> LspResult<InitializeResult> {
        let config = self.load_config(&params);
        let dynamic_watch = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|workspace| workspace.did_change_watched_files)
            .and_then(|watched| watched.dynamic_registration)
            .unwrap_or(false);
        self.watch_files.store(dynamic_watch, Ordering::Relaxed);
        let services = Arc::new(ToolchainServices::new(&config.toolchain));
        let sink = Arc::new(ClientSink::new(self.client.clone()));
        let validator = Validator::new(&config, services, sink).map_err(|e| {
            let mut error = LspError::internal_error();
            error.message = format!("{e:#}").into();
            error
        })?;
        if self.validator.set(validator).is_err() {
            debug!("initialize called twice, keeping the first configuration");
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![
                        PARSE_SAMPLE_COMMAND.to_owned(),
                        REVALIDATE_COMMAND.to_owned(),
                    ],
                    ..Default::default()
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "clausewright".to_owned(),
                version: Some(env!("CARGO_PKG_VERSION").to_owned()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        info!("language server initialized");
        if let Some(validator) = self.validator()
            && self.watch_files.load(Ordering::Relaxed)
        {
            let registration = watched_files_registration(validator.matcher().conventions());
            if let Err(e) = self.client.register_capability(vec![registration]).await {
                warn!("failed to register file watchers: {e}");
            }
        } else {
            debug!("client cannot watch files, relying on open documents");
        }
        self.client
            .log_message(MessageType::INFO, "clausewright language server initialized")
            .await;
    }

    async fn shutdown(&self) -> LspResult<()> {
        if let Some(validator) = self.validator() {
            let dropped = validator.cache().evict_all();
            debug!(dropped, "shutting down");
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(path) = file_path(&params.text_document.uri) else {
            return;
        };
        if let Some(validator) = self.validator_for(&path) {
            validator.open(path, params.text_document.text).await;
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(path) = file_path(&params.text_document.uri) else {
            return;
        };
        let Some(validator) = self.validator_for(&path) else {
            return;
        };
        // Full sync: the last change carries the whole document.
        if let Some(change) = params.content_changes.into_iter().last() {
            validator.change(path, change.text).await;
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let Some(path) = file_path(&params.text_document.uri) else {
            return;
        };
        let Some(validator) = self.validator_for(&path) else {
            return;
        };
        match params.text {
            Some(text) => validator.change(path, text).await,
            None => validator.disk_changed(&path).await,
        };
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Some(path) = file_path(&params.text_document.uri) else {
            return;
        };
        if let Some(validator) = self.validator_for(&path) {
            validator.close(&path).await;
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        for change in params.changes {
            let Some(path) = file_path(&change.uri) else {
                continue;
            };
            if let Some(validator) = self.validator_for(&path) {
                debug!(file = %path.display(), kind = ?change.typ, "watched file changed");
                validator.disk_changed(&path).await;
            }
        }
    }

    async fn code_action(&self, params: CodeActionParams) -> LspResult<Option<CodeActionResponse>> {
        let (Some(validator), Some(path)) =
            (self.validator(), file_path(&params.text_document.uri))
        else {
            return Ok(None);
        };
        let Some(site) = validator.template_model(&path).await else {
            return Ok(None);
        };
        let actions = add_variable_actions(&site, &params.context.diagnostics);
        Ok((!actions.is_empty()).then_some(actions))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> LspResult<Option<Value>> {
        match params.command.as_str() {
            PARSE_SAMPLE_COMMAND => self.parse_sample(&params.arguments).await,
            REVALIDATE_COMMAND => self.revalidate(&params.arguments).await,
            other => Err(LspError::invalid_params(format!("unknown command `{other}`"))),
        }
    }
}
