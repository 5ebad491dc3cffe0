//! One validation pass over a template project.
//!
//! Stages run in dependency order and stop at the first failure:
//! models, then logic, then the grammar, then the samples. Which of the later
//! stages run depends on what changed. Every stage that runs first clears the
//! diagnostics of its own kind, so a pass never leaves stale errors behind and
//! never removes what another stage reported.

use clausewright_core::conventions::{ConventionMatcher, FileKind};
use clausewright_core::{
    DiagnosticMap, DiagnosticRecord, FileOverlay, ProjectRoot, ServiceError, ServiceErrorKind,
    ServiceFactory, Severity, SourceFile, SourceKind, TextRange, VerboseLocationAdapter,
    attribute_file, error_range, read_file_with_overlay,
};
use eyre::WrapErr;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::ProjectCacheEntry;
use crate::config::ValidationSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Model,
    Logic,
    Grammar,
    Sample,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub model: StageOutcome,
    pub logic: StageOutcome,
    pub grammar: StageOutcome,
    pub sample: StageOutcome,
    /// External model dependencies could not be fetched; models were validated locally.
    pub offline: bool,
}

impl Default for PassReport {
    fn default() -> Self {
        Self {
            model: StageOutcome::Skipped,
            logic: StageOutcome::Skipped,
            grammar: StageOutcome::Skipped,
            sample: StageOutcome::Skipped,
            offline: false,
        }
    }
}

impl PassReport {
    pub fn outcome(&self, stage: Stage) -> StageOutcome {
        match stage {
            Stage::Model => self.model,
            Stage::Logic => self.logic,
            Stage::Grammar => self.grammar,
            Stage::Sample => self.sample,
        }
    }

    pub fn succeeded(&self) -> bool {
        [self.model, self.logic, self.grammar, self.sample]
            .iter()
            .all(|outcome| *outcome != StageOutcome::Failed)
    }
}

/// Files whose edits a pass accounts for. A full change set re-checks everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    files: BTreeSet<PathBuf>,
    full: bool,
}

impl ChangeSet {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            files: BTreeSet::from([path.into()]),
            full: false,
        }
    }

    pub fn full() -> Self {
        Self {
            files: BTreeSet::new(),
            full: true,
        }
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.files.extend(other.files);
        self.full |= other.full;
    }

    pub fn into_full(mut self) -> Self {
        self.full = true;
        self
    }

    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter()
    }

    pub fn is_full(&self) -> bool {
        self.full
    }
}

/// Which stages after the model validation a change set calls for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Triggers {
    pub logic: bool,
    pub grammar: bool,
    pub sample: bool,
}

impl Triggers {
    pub fn everything() -> Self {
        Self {
            logic: true,
            grammar: true,
            sample: true,
        }
    }

    pub fn for_kinds(kinds: impl IntoIterator<Item = FileKind>, has_template: bool) -> Self {
        let mut triggers = Self::default();
        for kind in kinds {
            match kind {
                FileKind::Marker | FileKind::Model => return Self::everything(),
                FileKind::Logic => {
                    triggers.logic = true;
                    triggers.sample |= has_template;
                }
                FileKind::Grammar => {
                    triggers.grammar = true;
                    triggers.sample = true;
                }
                FileKind::Sample => {
                    triggers.sample = true;
                    triggers.grammar |= !has_template;
                }
                FileKind::Other => {}
            }
        }
        triggers
    }
}

/// Everything a pass reads besides the cache entry it mutates.
pub struct PassContext<'a> {
    pub root: &'a ProjectRoot,
    pub changes: &'a ChangeSet,
    /// Snapshot of the open buffers taken when the pass started.
    pub overlay: &'a FileOverlay,
    /// Files under the root currently showing each kind.
    pub stale: &'a BTreeMap<SourceKind, Vec<PathBuf>>,
    /// Whether a newer change has made this pass pointless.
    pub superseded: &'a (dyn Fn() -> bool + Send + Sync),
}

#[derive(Debug)]
pub enum PassError {
    /// A newer change arrived; the pass was abandoned between stages.
    Superseded,
    /// Something other than a collaborator failed (I/O, a bug).
    Unexpected(eyre::Report),
}

impl From<eyre::Report> for PassError {
    fn from(report: eyre::Report) -> Self {
        PassError::Unexpected(report)
    }
}

pub struct Pipeline<'a> {
    matcher: &'a ConventionMatcher,
    services: &'a dyn ServiceFactory,
    settings: &'a ValidationSettings,
    locator: Option<&'a VerboseLocationAdapter>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        matcher: &'a ConventionMatcher,
        services: &'a dyn ServiceFactory,
        settings: &'a ValidationSettings,
        locator: Option<&'a VerboseLocationAdapter>,
    ) -> Self {
        Self {
            matcher,
            services,
            settings,
            locator,
        }
    }

    pub async fn run(
        &self,
        cx: &PassContext<'_>,
        entry: &mut ProjectCacheEntry,
        map: &mut DiagnosticMap,
    ) -> Result<PassReport, PassError> {
        let triggers = if entry.passes == 0 || cx.changes.is_full() {
            Triggers::everything()
        } else {
            Triggers::for_kinds(
                cx.changes
                    .files()
                    .map(|file| self.matcher.classify(&cx.root.path, file)),
                entry.template.is_some(),
            )
        };
        debug!(root = %cx.root.path.display(), ?triggers, "starting validation pass");

        entry.root = cx.root.clone();
        // Files under a resolved root are no longer orphans.
        self.clear_stage(cx, map, SourceKind::Root, &[]);
        self.clear_stage(cx, map, SourceKind::Internal, &[]);

        let mut report = PassReport::default();

        report.model = self.validate_model(cx, entry, map, &mut report.offline).await?;
        self.checkpoint(cx)?;
        if report.model == StageOutcome::Failed {
            return Ok(report);
        }

        if triggers.logic {
            report.logic = self.compile_logic(cx, entry, map).await?;
            self.checkpoint(cx)?;
            if report.logic == StageOutcome::Failed {
                return Ok(report);
            }
        }

        if triggers.grammar {
            let mut formulas_changed = false;
            report.grammar = self
                .build_grammar(cx, entry, map, &mut formulas_changed)
                .await?;
            self.checkpoint(cx)?;
            if report.grammar == StageOutcome::Failed {
                return Ok(report);
            }

            // New or edited formulas compile together with the logic.
            if formulas_changed {
                report.logic = self.compile_logic(cx, entry, map).await?;
                self.checkpoint(cx)?;
                if report.logic == StageOutcome::Failed {
                    return Ok(report);
                }
            }
        }

        if triggers.sample {
            report.sample = self.parse_samples(cx, entry, map).await?;
            self.checkpoint(cx)?;
        }

        info!(
            root = %cx.root.path.display(),
            model = ?report.model,
            logic = ?report.logic,
            grammar = ?report.grammar,
            sample = ?report.sample,
            "validation pass finished"
        );
        Ok(report)
    }

    fn checkpoint(&self, cx: &PassContext<'_>) -> Result<(), PassError> {
        if (cx.superseded)() {
            debug!(root = %cx.root.path.display(), "pass superseded, abandoning");
            return Err(PassError::Superseded);
        }
        Ok(())
    }

    /// Clear `kind` on the discovered files, the changed files and every file
    /// of the project still showing that kind.
    fn clear_stage(
        &self,
        cx: &PassContext<'_>,
        map: &mut DiagnosticMap,
        kind: SourceKind,
        discovered: &[PathBuf],
    ) {
        map.clear_all(discovered, kind);
        map.clear_all(cx.changes.files(), kind);
        if let Some(stale) = cx.stale.get(&kind) {
            map.clear_all(stale, kind);
        }
    }

    /// Discovered files of `kind` plus changed files of that kind living
    /// outside the conventional directories.
    fn files_of_kind(&self, cx: &PassContext<'_>, kind: FileKind) -> Vec<PathBuf> {
        let mut files: BTreeSet<PathBuf> = self
            .matcher
            .discover(&cx.root.path, kind, cx.overlay)
            .into_iter()
            .collect();
        for file in cx.changes.files() {
            if self.matcher.classify(&cx.root.path, file) == kind
                && (cx.overlay.contains_key(file) || file.is_file())
            {
                files.insert(file.clone());
            }
        }
        files.into_iter().collect()
    }

    /// File blamed for an error that names none.
    fn fallback_file(&self, cx: &PassContext<'_>, kind: FileKind, candidates: &[PathBuf]) -> PathBuf {
        cx.changes
            .files()
            .find(|file| self.matcher.classify(&cx.root.path, file) == kind)
            .or_else(|| candidates.first())
            .or_else(|| cx.changes.files().next())
            .cloned()
            .unwrap_or_else(|| cx.root.path.join(&self.matcher.conventions().marker_file))
    }

    fn push_error(
        &self,
        cx: &PassContext<'_>,
        map: &mut DiagnosticMap,
        kind: SourceKind,
        severity: Severity,
        error: &ServiceError,
        fallback: &Path,
    ) {
        let file = attribute_file(error, self.locator, &cx.root.path, fallback);
        debug!(file = %file.display(), %kind, "{error}");
        map.push(
            &file,
            DiagnosticRecord::new(severity, kind, error_range(error), error.message.clone()),
        );
    }

    async fn read(&self, cx: &PassContext<'_>, path: &Path) -> eyre::Result<SourceFile> {
        let text = read_file_with_overlay(path, cx.overlay)
            .await
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        Ok(SourceFile::new(path, text))
    }

    async fn validate_model(
        &self,
        cx: &PassContext<'_>,
        entry: &mut ProjectCacheEntry,
        map: &mut DiagnosticMap,
        offline: &mut bool,
    ) -> eyre::Result<StageOutcome> {
        let files = self.files_of_kind(cx, FileKind::Model);
        self.clear_stage(cx, map, SourceKind::Model, &files);

        entry.model_valid = false;
        entry.model_manager.clear_model_files();
        for path in &files {
            let source = self.read(cx, path).await?;
            if let Err(error) = entry.model_manager.add_model_file(source) {
                self.push_error(cx, map, SourceKind::Model, Severity::Error, &error, path);
                return Ok(StageOutcome::Failed);
            }
        }

        let fallback = self.fallback_file(cx, FileKind::Model, &files);
        let timeout = self.settings.dependency_timeout();
        let unreachable =
            match tokio::time::timeout(timeout, entry.model_manager.update_external_models()).await
            {
                Ok(Ok(())) => None,
                Ok(Err(error)) if error.is_connectivity() => Some(error),
                Ok(Err(error)) => {
                    self.push_error(cx, map, SourceKind::Model, Severity::Error, &error, &fallback);
                    return Ok(StageOutcome::Failed);
                }
                Err(_) => Some(ServiceError::new(
                    ServiceErrorKind::Connectivity,
                    format!("timed out after {}ms", timeout.as_millis()),
                )),
            };

        if let Some(error) = unreachable {
            warn!(root = %cx.root.path.display(), "external models unavailable ({error}), validating offline");
            *offline = true;
            let warning = ServiceError {
                message: format!(
                    "Could not resolve external models: {}. Validated offline.",
                    error.message
                ),
                ..error
            };
            self.push_error(cx, map, SourceKind::Model, Severity::Warning, &warning, &fallback);

            if let Err(error) = entry.model_manager.validate().await {
                self.push_error(cx, map, SourceKind::Model, Severity::Error, &error, &fallback);
                return Ok(StageOutcome::Failed);
            }
        }

        entry.model_valid = true;
        Ok(StageOutcome::Passed)
    }

    async fn compile_logic(
        &self,
        cx: &PassContext<'_>,
        entry: &mut ProjectCacheEntry,
        map: &mut DiagnosticMap,
    ) -> eyre::Result<StageOutcome> {
        let files = self.files_of_kind(cx, FileKind::Logic);
        self.clear_stage(cx, map, SourceKind::Logic, &files);

        for known in entry.logic_manager.logic_files() {
            if !files.contains(&known) {
                entry.logic_manager.remove_logic(&known);
            }
        }
        if files.is_empty() && entry.logic_manager.is_empty() {
            return Ok(StageOutcome::Skipped);
        }

        for path in &files {
            let source = self.read(cx, path).await?;
            entry.logic_manager.update_logic(source);
        }

        match entry
            .logic_manager
            .compile(&*entry.model_manager)
            .await
        {
            Ok(()) => Ok(StageOutcome::Passed),
            Err(error) => {
                let fallback = self.fallback_file(cx, FileKind::Logic, &files);
                self.push_error(cx, map, SourceKind::Logic, Severity::Error, &error, &fallback);
                Ok(StageOutcome::Failed)
            }
        }
    }

    async fn build_grammar(
        &self,
        cx: &PassContext<'_>,
        entry: &mut ProjectCacheEntry,
        map: &mut DiagnosticMap,
        formulas_changed: &mut bool,
    ) -> eyre::Result<StageOutcome> {
        let grammars = self.files_of_kind(cx, FileKind::Grammar);
        self.clear_stage(cx, map, SourceKind::Grammar, &grammars);

        let Some(path) = grammars.first() else {
            entry.drop_template();
            let file = self.fallback_file(cx, FileKind::Grammar, &grammars);
            map.push(
                &file,
                DiagnosticRecord::error(
                    SourceKind::Grammar,
                    TextRange::ZERO,
                    format!(
                        "No grammar found, expected {}",
                        self.matcher.conventions().grammar_globs.join(" or ")
                    ),
                ),
            );
            return Ok(StageOutcome::Failed);
        };

        let source = self.read(cx, path).await?;
        let builder = self.services.template_builder(cx.root);
        match builder
            .build(cx.root.kind, source, &*entry.model_manager)
            .await
        {
            Ok(template) => {
                entry.drop_template();
                let formulas = template.formulas();
                if formulas != entry.formulas {
                    debug!(count = formulas.len(), "grammar formulas changed");
                    entry.logic_manager.register_formulas(formulas.clone());
                    entry.formulas = formulas;
                    *formulas_changed = true;
                }
                debug!(template = %template.identifier(), "grammar built");
                entry.template = Some(template);
                Ok(StageOutcome::Passed)
            }
            Err(error) => {
                entry.drop_template();
                self.push_error(cx, map, SourceKind::Grammar, Severity::Error, &error, path);
                Ok(StageOutcome::Failed)
            }
        }
    }

    async fn parse_samples(
        &self,
        cx: &PassContext<'_>,
        entry: &mut ProjectCacheEntry,
        map: &mut DiagnosticMap,
    ) -> eyre::Result<StageOutcome> {
        let Some(template) = entry.template.clone() else {
            return Ok(StageOutcome::Skipped);
        };
        let samples = self.files_of_kind(cx, FileKind::Sample);
        self.clear_stage(cx, map, SourceKind::Sample, &samples);
        entry.parses.retain(|path, _| samples.contains(path));

        let mut outcome = StageOutcome::Passed;
        for path in &samples {
            let source = self.read(cx, path).await?;
            match template.parse_sample(source).await {
                Ok(parsed) => {
                    entry.parses.insert(path.clone(), parsed);
                }
                Err(error) => {
                    entry.parses.remove(path);
                    self.push_error(cx, map, SourceKind::Sample, Severity::Error, &error, path);
                    outcome = StageOutcome::Failed;
                }
            }
        }
        Ok(outcome)
    }
}
