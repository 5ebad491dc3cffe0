//! Collaborators backed by an external bridge program.
//!
//! The model compiler, logic compiler and grammar parser are not part of this
//! workspace. The configured bridge command is started once per operation; it
//! reads one JSON request on stdin and answers with one JSON reply on stdout:
//!
//! ```json
//! { "op": "build_template", "root": "/work/hello", "kind": "clause", "grammar": { ... }, "models": [ ... ] }
//! { "result": { "identifier": "hello@0.0.1", "formulas": [] } }
//! { "error": { "kind": "structural", "message": "Unknown property amount" } }
//! ```

use async_trait::async_trait;
use clausewright_core::{
    CompiledTemplate, DeclarationSite, Formula, LogicManager, ModelManager, ProjectRoot,
    ServiceError, ServiceErrorKind, ServiceFactory, SourceFile, TemplateBuilder, TemplateKind,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::ToolchainConfig;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeRequest<'a> {
    ValidateModels {
        root: &'a Path,
        models: &'a [SourceFile],
        resolve_external: bool,
    },
    CompileLogic {
        root: &'a Path,
        models: &'a [SourceFile],
        logic: Vec<SourceFile>,
        formulas: &'a [Formula],
    },
    BuildTemplate {
        root: &'a Path,
        kind: TemplateKind,
        grammar: &'a SourceFile,
        models: &'a [SourceFile],
    },
    ParseSample {
        root: &'a Path,
        kind: TemplateKind,
        grammar: &'a SourceFile,
        models: &'a [SourceFile],
        sample: &'a SourceFile,
    },
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Default, Deserialize)]
struct ValidateModelsReply {
    #[serde(default)]
    template_model: Option<DeclarationSite>,
}

#[derive(Debug, Deserialize)]
struct BuildTemplateReply {
    identifier: String,
    #[serde(default)]
    formulas: Vec<Formula>,
}

#[derive(Debug)]
pub struct Bridge {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Bridge {
    pub fn new(config: &ToolchainConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: &BridgeRequest<'_>) -> Result<T, ServiceError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ServiceError::io(format!("failed to encode bridge request: {e}")))?;
        trace!(command = %self.command, bytes = payload.len(), "calling bridge");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::io(format!("failed to start `{}`: {e}", self.command)))?;

        // Feed stdin while collecting output, so neither pipe can fill up and
        // stall the other, and bound the whole exchange by one timeout.
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let exchange = async { tokio::join!(write, child.wait_with_output()) };
        let (written, output) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ServiceError::io(format!(
                    "`{}` did not answer within {}ms",
                    self.command,
                    self.timeout.as_millis()
                ))
            })?;
        let output = output.map_err(|e| ServiceError::io(format!("`{}` failed: {e}", self.command)))?;
        written.map_err(|e| ServiceError::io(format!("failed to write to `{}`: {e}", self.command)))?;

        if !output.stderr.is_empty() {
            debug!(command = %self.command, "{}", String::from_utf8_lossy(&output.stderr).trim_end());
        }

        let reply: BridgeReply = serde_json::from_slice(&output.stdout).map_err(|e| {
            ServiceError::io(format!(
                "`{}` exited with {} and an unreadable reply: {e}",
                self.command, output.status
            ))
        })?;
        if let Some(error) = reply.error {
            return Err(error);
        }
        serde_json::from_value(reply.result)
            .map_err(|e| ServiceError::io(format!("unexpected reply from `{}`: {e}", self.command)))
    }
}

/// Model files for one project, validated through the bridge.
pub struct BridgeModels {
    bridge: Arc<Bridge>,
    root: PathBuf,
    files: Vec<SourceFile>,
    template_model: Option<DeclarationSite>,
}

impl BridgeModels {
    async fn check(&mut self, resolve_external: bool) -> Result<(), ServiceError> {
        self.template_model = None;
        let reply: Option<ValidateModelsReply> = self
            .bridge
            .call(&BridgeRequest::ValidateModels {
                root: &self.root,
                models: &self.files,
                resolve_external,
            })
            .await?;
        self.template_model = reply.and_then(|r| r.template_model).map(|site| DeclarationSite {
            file: absolute(&self.root, &site.file),
            range: site.range,
        });
        Ok(())
    }
}

fn absolute(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[async_trait]
impl ModelManager for BridgeModels {
    fn clear_model_files(&mut self) {
        self.files.clear();
        self.template_model = None;
    }

    fn add_model_file(&mut self, file: SourceFile) -> Result<(), ServiceError> {
        if file.text.trim().is_empty() {
            return Err(ServiceError::new(ServiceErrorKind::Structural, "Model file is empty")
                .with_file(file.path));
        }
        match self.files.iter_mut().find(|known| known.path == file.path) {
            Some(known) => *known = file,
            None => self.files.push(file),
        }
        Ok(())
    }

    fn model_files(&self) -> Vec<SourceFile> {
        self.files.clone()
    }

    async fn update_external_models(&mut self) -> Result<(), ServiceError> {
        self.check(true).await
    }

    async fn validate(&mut self) -> Result<(), ServiceError> {
        self.check(false).await
    }

    fn template_model(&self) -> Option<DeclarationSite> {
        self.template_model.clone()
    }
}

/// Logic files and grammar formulas for one project, compiled through the bridge.
pub struct BridgeLogic {
    bridge: Arc<Bridge>,
    root: PathBuf,
    files: BTreeMap<PathBuf, String>,
    formulas: Vec<Formula>,
}

#[async_trait]
impl LogicManager for BridgeLogic {
    fn update_logic(&mut self, file: SourceFile) {
        self.files.insert(file.path, file.text);
    }

    fn remove_logic(&mut self, path: &Path) {
        self.files.remove(path);
    }

    fn logic_files(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    fn register_formulas(&mut self, formulas: Vec<Formula>) {
        self.formulas = formulas;
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.formulas.is_empty()
    }

    async fn compile(&mut self, models: &dyn ModelManager) -> Result<(), ServiceError> {
        let logic = self
            .files
            .iter()
            .map(|(path, text)| SourceFile::new(path.clone(), text.clone()))
            .collect();
        let _: serde_json::Value = self
            .bridge
            .call(&BridgeRequest::CompileLogic {
                root: &self.root,
                models: &models.model_files(),
                logic,
                formulas: &self.formulas,
            })
            .await?;
        Ok(())
    }
}

pub struct BridgeTemplateBuilder {
    bridge: Arc<Bridge>,
    root: PathBuf,
}

#[async_trait]
impl TemplateBuilder for BridgeTemplateBuilder {
    async fn build(
        &self,
        kind: TemplateKind,
        grammar: SourceFile,
        models: &dyn ModelManager,
    ) -> Result<Arc<dyn CompiledTemplate>, ServiceError> {
        let models = models.model_files();
        let reply: BuildTemplateReply = self
            .bridge
            .call(&BridgeRequest::BuildTemplate {
                root: &self.root,
                kind,
                grammar: &grammar,
                models: &models,
            })
            .await?;
        Ok(Arc::new(BridgeTemplate {
            bridge: self.bridge.clone(),
            root: self.root.clone(),
            kind,
            grammar,
            models,
            identifier: reply.identifier,
            formulas: reply.formulas,
        }))
    }
}

/// A grammar that built successfully, with the inputs it was built from.
pub struct BridgeTemplate {
    bridge: Arc<Bridge>,
    root: PathBuf,
    kind: TemplateKind,
    grammar: SourceFile,
    models: Vec<SourceFile>,
    identifier: String,
    formulas: Vec<Formula>,
}

#[async_trait]
impl CompiledTemplate for BridgeTemplate {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn formulas(&self) -> Vec<Formula> {
        self.formulas.clone()
    }

    async fn parse_sample(&self, sample: SourceFile) -> Result<serde_json::Value, ServiceError> {
        self.bridge
            .call(&BridgeRequest::ParseSample {
                root: &self.root,
                kind: self.kind,
                grammar: &self.grammar,
                models: &self.models,
                sample: &sample,
            })
            .await
    }
}

/// Creates bridge-backed collaborators.
pub struct ToolchainServices {
    bridge: Arc<Bridge>,
}

impl ToolchainServices {
    pub fn new(config: &ToolchainConfig) -> Self {
        Self {
            bridge: Arc::new(Bridge::new(config)),
        }
    }
}

impl ServiceFactory for ToolchainServices {
    fn model_manager(&self, root: &ProjectRoot) -> Box<dyn ModelManager> {
        Box::new(BridgeModels {
            bridge: self.bridge.clone(),
            root: root.path.clone(),
            files: Vec::new(),
            template_model: None,
        })
    }

    fn logic_manager(&self, root: &ProjectRoot) -> Box<dyn LogicManager> {
        Box::new(BridgeLogic {
            bridge: self.bridge.clone(),
            root: root.path.clone(),
            files: BTreeMap::new(),
            formulas: Vec::new(),
        })
    }

    fn template_builder(&self, root: &ProjectRoot) -> Arc<dyn TemplateBuilder> {
        Arc::new(BridgeTemplateBuilder {
            bridge: self.bridge.clone(),
            root: root.path.clone(),
        })
    }
}
