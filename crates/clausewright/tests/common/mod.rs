//! Common test utilities.
//!
//! The collaborators here are small stand-ins for the real model compiler,
//! logic compiler and grammar parser. They understand just enough of the
//! template languages to fail the way the real ones do:
//!
//! - a model line containing `SYNTAX ERROR` fails to load
//! - an `o <Type> <name>` field with an undeclared type fails validation
//! - a logic line containing `COMPILE ERROR` fails compilation, naming the file
//!   only in the verbose output; a grammar formula containing it fails too
//! - a grammar `{{variable}}` missing from the models is an unknown property
//! - a sample containing `UNPARSEABLE` fails to parse

#![allow(dead_code)]

use async_trait::async_trait;
use clausewright::config::Config;
use clausewright::{PassReport, RecordingSink, Validator};
use clausewright_core::services::{ErrorSpan, SourcePoint};
use clausewright_core::{
    CompiledTemplate, DeclarationSite, DiagnosticRecord, Formula, LogicManager, ModelManager,
    ProjectRoot, ServiceError, ServiceErrorKind, ServiceFactory, SourceFile, TemplateBuilder,
    TemplateKind, TextRange,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Get the path to the test fixtures directory.
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

fn copy_dir(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).expect("Failed to create fixture dir");
    for entry in std::fs::read_dir(from).expect("Failed to read fixture dir") {
        let entry = entry.expect("Failed to read fixture entry");
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).expect("Failed to copy fixture file");
        }
    }
}

/// Copy the `helloworld` template (grammar, sample and model, no logic) to `to`.
pub fn copy_fixture(to: &Path) {
    copy_dir(&fixtures_dir().join("helloworld"), to);
}

/// Create a temporary directory holding a copy of the `helloworld` template
/// under `helloworld/`.
pub fn create_temp_project() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("Failed to create temp dir");
    copy_fixture(&temp.path().join("helloworld"));
    temp
}

pub const LOGIC: &str = r#"namespace org.example.helloworld

contract HelloWorld over HelloClause {
  clause greet(request : MyRequest) : MyResponse {
    return MyResponse{ output: "Hello " ++ contract.name ++ " " ++ request.input }
  }
}
"#;

#[derive(Default)]
pub struct Counters {
    pub external: AtomicUsize,
    pub validate: AtomicUsize,
    pub compile: AtomicUsize,
    pub build: AtomicUsize,
    pub parse: AtomicUsize,
    compiling: AtomicUsize,
    pub max_concurrent_compiles: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub offline: bool,
    pub hang_external: bool,
    pub compile_delay: Duration,
}

#[derive(Clone, Default)]
pub struct FakeServices {
    pub counters: Arc<Counters>,
    behavior: Arc<Mutex<Behavior>>,
    formulas: Arc<Mutex<Vec<Formula>>>,
}

impl FakeServices {
    pub fn new() -> Self {
        Self::default()
    }

    fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.behavior.lock().unwrap().offline = offline;
    }

    pub fn set_hang_external(&self, hang: bool) {
        self.behavior.lock().unwrap().hang_external = hang;
    }

    pub fn set_compile_delay(&self, delay: Duration) {
        self.behavior.lock().unwrap().compile_delay = delay;
    }

    /// Formulas most recently registered with a logic manager.
    pub fn registered_formulas(&self) -> Vec<Formula> {
        self.formulas.lock().unwrap().clone()
    }

    pub fn count(&self, counter: impl Fn(&Counters) -> &AtomicUsize) -> usize {
        Counters::get(counter(&self.counters))
    }
}

const BUILTIN_TYPES: &[&str] = &["String", "Double", "Integer", "Long", "Boolean", "DateTime"];

/// `(file, zero-based line, type, name)` of every `o <Type> <name>` field.
fn fields(models: &[SourceFile]) -> Vec<(PathBuf, u32, String, String)> {
    let mut fields = Vec::new();
    for model in models {
        for (line, text) in model.text.lines().enumerate() {
            let mut tokens = text.split_whitespace();
            if tokens.next() != Some("o") {
                continue;
            }
            if let (Some(ty), Some(name)) = (tokens.next(), tokens.next()) {
                fields.push((model.path.clone(), line as u32, ty.to_owned(), name.to_owned()));
            }
        }
    }
    fields
}

fn declared_types(models: &[SourceFile]) -> Vec<String> {
    models
        .iter()
        .flat_map(|model| model.text.lines())
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("asset" | "concept" | "transaction" | "participant" | "event") => {
                    tokens.next().map(str::to_owned)
                }
                _ => None,
            }
        })
        .collect()
}

pub struct FakeModels {
    services: FakeServices,
    files: Vec<SourceFile>,
    template: Option<DeclarationSite>,
}

impl FakeModels {
    fn check(&mut self) -> Result<(), ServiceError> {
        self.template = None;
        let declared = declared_types(&self.files);
        for (file, line, ty, _) in fields(&self.files) {
            if !BUILTIN_TYPES.contains(&ty.as_str()) && !declared.contains(&ty) {
                return Err(ServiceError::new(
                    ServiceErrorKind::Structural,
                    format!("Undeclared type {ty}"),
                )
                .with_file(file)
                .with_span(ErrorSpan::Parser {
                    start: SourcePoint::new(line + 1, 2),
                    end: SourcePoint::new(line + 1, 4 + ty.len() as u32),
                }));
            }
        }

        for model in &self.files {
            let lines: Vec<&str> = model.text.lines().collect();
            let Some(marker) = lines.iter().position(|l| l.trim() == "@template") else {
                continue;
            };
            let declaration = marker + 1;
            let Some(close) = lines
                .iter()
                .skip(declaration)
                .position(|l| l.trim() == "}")
                .map(|offset| declaration + offset)
            else {
                continue;
            };
            self.template = Some(DeclarationSite {
                file: model.path.clone(),
                range: TextRange::new(declaration as u32, 0, close as u32, 1),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ModelManager for FakeModels {
    fn clear_model_files(&mut self) {
        self.files.clear();
        self.template = None;
    }

    fn add_model_file(&mut self, file: SourceFile) -> Result<(), ServiceError> {
        if let Some(line) = file.text.lines().position(|l| l.contains("SYNTAX ERROR")) {
            let line = line as u32 + 1;
            return Err(ServiceError::new(
                ServiceErrorKind::Structural,
                "Expected \"concept\", \"asset\" or \"transaction\" but \"SYNTAX\" found.",
            )
            .with_file(file.path)
            .with_span(ErrorSpan::Parser {
                start: SourcePoint::new(line, 0),
                end: SourcePoint::new(line, 12),
            }));
        }
        self.files.push(file);
        Ok(())
    }

    fn model_files(&self) -> Vec<SourceFile> {
        self.files.clone()
    }

    async fn update_external_models(&mut self) -> Result<(), ServiceError> {
        self.services.counters.external.fetch_add(1, Ordering::SeqCst);
        let behavior = self.services.behavior();
        if behavior.hang_external {
            std::future::pending::<()>().await;
        }
        if behavior.offline {
            return Err(ServiceError::new(
                ServiceErrorKind::Connectivity,
                "getaddrinfo ENOTFOUND models.accordproject.org",
            ));
        }
        self.check()
    }

    async fn validate(&mut self) -> Result<(), ServiceError> {
        self.services.counters.validate.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    fn template_model(&self) -> Option<DeclarationSite> {
        self.template.clone()
    }
}

pub struct FakeLogic {
    services: FakeServices,
    root: PathBuf,
    files: BTreeMap<PathBuf, String>,
    formulas: Vec<Formula>,
}

#[async_trait]
impl LogicManager for FakeLogic {
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
        *self.services.formulas.lock().unwrap() = formulas.clone();
        self.formulas = formulas;
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.formulas.is_empty()
    }

    async fn compile(&mut self, _models: &dyn ModelManager) -> Result<(), ServiceError> {
        let counters = &self.services.counters;
        counters.compile.fetch_add(1, Ordering::SeqCst);
        let running = counters.compiling.fetch_add(1, Ordering::SeqCst) + 1;
        counters
            .max_concurrent_compiles
            .fetch_max(running, Ordering::SeqCst);

        let delay = self.services.behavior().compile_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        counters.compiling.fetch_sub(1, Ordering::SeqCst);

        for (path, text) in &self.files {
            if let Some(line) = text.lines().position(|l| l.contains("COMPILE ERROR")) {
                let line = line as u32 + 1;
                let relative = path.strip_prefix(&self.root).unwrap_or(path);
                return Err(ServiceError::new(
                    ServiceErrorKind::Compilation,
                    "Compilation error: Variable amount not found",
                )
                .with_verbose(format!(
                    "Compilation error at file {} line {line} col 2\n  Variable amount not found",
                    relative.display()
                ))
                .with_span(ErrorSpan::Compiler {
                    start: SourcePoint::new(line, 2),
                    end: SourcePoint::new(0, 0),
                }));
            }
        }
        if let Some(formula) = self.formulas.iter().find(|f| f.code.contains("COMPILE ERROR")) {
            return Err(ServiceError::new(
                ServiceErrorKind::Compilation,
                format!("Compilation error in {}: unknown expression", formula.name),
            ));
        }
        Ok(())
    }
}

/// `{{variable}}` names and `{{% formula %}}` bodies of a grammar.
fn grammar_parts(text: &str) -> (Vec<String>, Vec<String>) {
    let mut variables = Vec::new();
    let mut formulas = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let inner = after[..end].trim();
        if let Some(code) = inner.strip_prefix('%') {
            formulas.push(code.trim_end_matches('%').trim().to_owned());
        } else if !inner.starts_with('#') && !inner.starts_with('/') && !inner.is_empty() {
            variables.push(inner.to_owned());
        }
        rest = &after[end + 2..];
    }
    (variables, formulas)
}

pub struct FakeTemplateBuilder {
    services: FakeServices,
}

#[async_trait]
impl TemplateBuilder for FakeTemplateBuilder {
    async fn build(
        &self,
        _kind: TemplateKind,
        grammar: SourceFile,
        models: &dyn ModelManager,
    ) -> Result<Arc<dyn CompiledTemplate>, ServiceError> {
        self.services.counters.build.fetch_add(1, Ordering::SeqCst);
        let known: Vec<String> = fields(&models.model_files())
            .into_iter()
            .map(|(_, _, _, name)| name)
            .collect();
        let (variables, formulas) = grammar_parts(&grammar.text);
        if let Some(unknown) = variables.iter().find(|v| !known.contains(v)) {
            return Err(ServiceError::new(
                ServiceErrorKind::Structural,
                format!("Unknown property {unknown}"),
            ));
        }
        Ok(Arc::new(FakeTemplate {
            services: self.services.clone(),
            formulas: formulas
                .into_iter()
                .enumerate()
                .map(|(i, code)| Formula {
                    name: format!("formula{i}"),
                    code,
                })
                .collect(),
        }))
    }
}

pub struct FakeTemplate {
    services: FakeServices,
    formulas: Vec<Formula>,
}

#[async_trait]
impl CompiledTemplate for FakeTemplate {
    fn identifier(&self) -> String {
        "helloworld@0.0.1".to_owned()
    }

    fn formulas(&self) -> Vec<Formula> {
        self.formulas.clone()
    }

    async fn parse_sample(&self, sample: SourceFile) -> Result<serde_json::Value, ServiceError> {
        self.services.counters.parse.fetch_add(1, Ordering::SeqCst);
        if sample.text.contains("UNPARSEABLE") {
            return Err(ServiceError::new(
                ServiceErrorKind::Parse,
                "Parse error at line 1 column 1",
            )
            .with_span(ErrorSpan::Parser {
                start: SourcePoint::new(1, 0),
                end: SourcePoint::new(1, 11),
            }));
        }
        Ok(serde_json::json!({
            "$class": "org.example.helloworld.HelloClause",
            "text": sample.text.trim(),
        }))
    }
}

impl ServiceFactory for FakeServices {
    fn model_manager(&self, _root: &ProjectRoot) -> Box<dyn ModelManager> {
        Box::new(FakeModels {
            services: self.clone(),
            files: Vec::new(),
            template: None,
        })
    }

    fn logic_manager(&self, root: &ProjectRoot) -> Box<dyn LogicManager> {
        Box::new(FakeLogic {
            services: self.clone(),
            root: root.path.clone(),
            files: BTreeMap::new(),
            formulas: Vec::new(),
        })
    }

    fn template_builder(&self, _root: &ProjectRoot) -> Arc<dyn TemplateBuilder> {
        Arc::new(FakeTemplateBuilder {
            services: self.clone(),
        })
    }
}

/// A temp copy of the fixture project wired to a validator with fake collaborators.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub root: PathBuf,
    pub services: FakeServices,
    pub sink: Arc<RecordingSink>,
    pub validator: Validator,
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> Harness {
    let dir = create_temp_project();
    let root = dir.path().join("helloworld");
    let services = FakeServices::new();
    let sink = Arc::new(RecordingSink::new());
    let validator = Validator::new(&config, Arc::new(services.clone()), sink.clone())
        .expect("Failed to create validator");
    Harness {
        dir,
        root,
        services,
        sink,
        validator,
    }
}

impl Harness {
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write a file on disk, creating parent directories.
    pub fn write(&self, relative: &str, text: &str) {
        let path = self.path(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }

    /// Simulate typing into an open buffer.
    pub async fn edit(&self, relative: &str, text: &str) {
        self.validator
            .change(self.path(relative), text.to_owned())
            .await;
    }

    /// Open a file with its disk content and wait for validation to settle.
    pub async fn open_and_settle(&self, relative: &str) {
        let text = self.read(relative);
        self.validator.open(self.path(relative), text).await;
        self.settle().await;
    }

    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.validator.wait_idle())
            .await
            .expect("validation did not settle");
    }

    pub async fn report(&self) -> PassReport {
        self.validator
            .last_report(&self.root)
            .await
            .expect("no pass report for the project")
    }

    /// What the editor shows for a file right now.
    pub fn shown(&self, relative: &str) -> Vec<DiagnosticRecord> {
        self.sink.current(&self.path(relative))
    }
}
