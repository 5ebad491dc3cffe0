//! Scheduling validation passes.
//!
//! Passes for one project run one at a time on a worker task. Edits arriving
//! while a pass runs are coalesced into a single pending change set and bump the
//! project's generation; the running pass notices at its next stage boundary,
//! drops its results and hands its change set back to the pending one. Only the
//! results of a pass that was still current when it finished are published.

use clausewright_core::conventions::ConventionMatcher;
use clausewright_core::{
    DeclarationSite, DiagnosticMap, DiagnosticRecord, FileOverlay, ProjectRoot,
    PublishedDiagnostics, RootResolution, RootResolver, ServiceFactory, SourceKind, TextRange,
    VerboseLocationAdapter,
};
use eyre::{Result, WrapErr};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info};

use crate::cache::ProjectCache;
use crate::config::{Config, ValidationSettings};
use crate::notifier::{ChangeNotifier, DiagnosticSink};
use crate::pipeline::{ChangeSet, PassContext, PassError, PassReport, Pipeline};

#[derive(Default)]
struct RootQueue {
    generation: u64,
    pending: Option<(ProjectRoot, ChangeSet)>,
    running: bool,
}

enum PassResult {
    Committed,
    Superseded,
}

struct Inner {
    matcher: ConventionMatcher,
    resolver: RootResolver,
    locator: Option<VerboseLocationAdapter>,
    services: Arc<dyn ServiceFactory>,
    settings: ValidationSettings,
    cache: ProjectCache,
    overlay: RwLock<FileOverlay>,
    published: Mutex<PublishedDiagnostics>,
    /// Only roots with a queued or running pass have a queue.
    queues: Mutex<HashMap<PathBuf, RootQueue>>,
    /// Every root resolved so far, to keep nested projects apart.
    roots: Mutex<BTreeSet<PathBuf>>,
    notifier: ChangeNotifier,
    /// Worker tasks alive right now.
    busy: watch::Sender<usize>,
}

/// Entry point for everything that should cause validation.
#[derive(Clone)]
pub struct Validator {
    inner: Arc<Inner>,
}

impl Validator {
    pub fn new(
        config: &Config,
        services: Arc<dyn ServiceFactory>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let matcher = ConventionMatcher::new(config.conventions.clone())
            .wrap_err("Invalid file conventions in config")?;
        let locator = matcher
            .logic_extension()
            .map(VerboseLocationAdapter::for_extension)
            .transpose()
            .wrap_err("Invalid logic file extension in config")?;
        let (busy, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(Inner {
                resolver: RootResolver::new(&config.conventions),
                matcher,
                locator,
                cache: ProjectCache::new(services.clone(), config.validation.max_projects),
                services,
                settings: config.validation.clone(),
                overlay: RwLock::new(FileOverlay::new()),
                published: Mutex::new(PublishedDiagnostics::default()),
                queues: Mutex::new(HashMap::new()),
                roots: Mutex::new(BTreeSet::new()),
                notifier: ChangeNotifier::new(sink),
                busy,
            }),
        })
    }

    pub fn matcher(&self) -> &ConventionMatcher {
        &self.inner.matcher
    }

    pub fn cache(&self) -> &ProjectCache {
        &self.inner.cache
    }

    /// A document was opened in the editor.
    pub async fn open(&self, path: PathBuf, text: String) -> Option<PathBuf> {
        self.inner.overlay.write().await.insert(path.clone(), text);
        self.submit(&path).await
    }

    /// An open document's content changed.
    pub async fn change(&self, path: PathBuf, text: String) -> Option<PathBuf> {
        self.open(path, text).await
    }

    /// A document was closed; from now on its disk content counts.
    pub async fn close(&self, path: &Path) -> Option<PathBuf> {
        self.inner.overlay.write().await.remove(path);
        self.submit(path).await
    }

    /// A file changed on disk (saved, created, deleted).
    pub async fn disk_changed(&self, path: &Path) -> Option<PathBuf> {
        self.submit(path).await
    }

    /// Validate the project `file` belongs to, accounting for its change.
    /// Returns the project root when there is one.
    pub async fn submit(&self, file: &Path) -> Option<PathBuf> {
        match self.resolve(file).await {
            RootResolution::NotFound { probed } => {
                info!(file = %file.display(), probed, "file is not part of a template project");
                let conventions = self.inner.matcher.conventions();
                let mut map = DiagnosticMap::new();
                for kind in SourceKind::ALL {
                    map.clear(file, kind);
                }
                // A marker without the project key is just someone else's package.json.
                let is_marker = file
                    .file_name()
                    .is_some_and(|name| name == conventions.marker_file.as_str());
                if is_marker {
                    self.inner.commit(map).await;
                    return None;
                }
                map.push(
                    file,
                    DiagnosticRecord::warning(
                        SourceKind::Root,
                        TextRange::ZERO,
                        format!(
                            "Not part of a template project: no `{}` with an `{}` key found in any parent directory",
                            conventions.marker_file, conventions.project_key
                        ),
                    ),
                );
                self.inner.commit(map).await;
                None
            }
            RootResolution::Found(root) => {
                let had_root_diagnostic = self.inner.published().has_kind(file, SourceKind::Root);
                if had_root_diagnostic {
                    let mut map = DiagnosticMap::new();
                    map.clear(file, SourceKind::Root);
                    self.inner.commit(map).await;
                }
                let path = root.path.clone();
                self.schedule(root, ChangeSet::file(file));
                Some(path)
            }
        }
    }

    /// Re-check everything in the project `file` belongs to.
    pub async fn revalidate(&self, file: &Path) -> Option<PathBuf> {
        match self.resolve(file).await {
            RootResolution::Found(root) => {
                let path = root.path.clone();
                self.schedule(root, ChangeSet::full());
                Some(path)
            }
            RootResolution::NotFound { .. } => None,
        }
    }

    /// Forget a project: its cached collaborators and everything it published.
    pub async fn invalidate(&self, root: &Path) {
        {
            let mut queues = self.inner.queues();
            if let Some(queue) = queues.get_mut(root) {
                if queue.running {
                    // Supersede the pass in flight without queueing another.
                    queue.generation += 1;
                    queue.pending = None;
                } else {
                    queues.remove(root);
                }
            }
        }
        self.inner.known_roots().remove(root);
        self.inner.cache.invalidate(root);
        let cleared = self.inner.published().remove_under(root);
        info!(root = %root.display(), files = cleared.len(), "project invalidated");
        self.inner
            .notifier
            .publish(cleared.into_iter().map(|file| (file, Vec::new())).collect())
            .await;
    }

    /// Resolves once no pass is queued or running.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|workers| *workers == 0).await;
    }

    pub async fn resolve(&self, file: &Path) -> RootResolution {
        let overlay = self.inner.overlay.read().await;
        self.inner.resolver.resolve(file, &overlay).await
    }

    /// What is currently published for `file`.
    pub fn published(&self, file: &Path) -> Vec<DiagnosticRecord> {
        self.inner.published().get(file).to_vec()
    }

    pub fn published_all(&self) -> BTreeMap<PathBuf, Vec<DiagnosticRecord>> {
        self.inner
            .published()
            .iter()
            .map(|(file, records)| (file.to_path_buf(), records.to_vec()))
            .collect()
    }

    pub async fn last_report(&self, root: &Path) -> Option<PassReport> {
        let entry = self.inner.cache.get(root)?;
        let entry = entry.lock().await;
        entry.last_report.clone()
    }

    /// Last successful parse of a sample in the project `file` belongs to;
    /// the file's own parse when it is a sample.
    pub async fn last_parse(&self, file: &Path) -> Option<serde_json::Value> {
        let RootResolution::Found(root) = self.resolve(file).await else {
            return None;
        };
        let entry = self.inner.cache.get(&root.path)?;
        let entry = entry.lock().await;
        entry
            .parses
            .get(file)
            .or_else(|| entry.parses.values().next())
            .cloned()
    }

    /// Declaration the grammar binds to, once the models validated.
    pub async fn template_model(&self, file: &Path) -> Option<DeclarationSite> {
        let RootResolution::Found(root) = self.resolve(file).await else {
            return None;
        };
        let entry = self.inner.cache.get(&root.path)?;
        let entry = entry.lock().await;
        if !entry.model_valid {
            return None;
        }
        entry.model_manager.template_model()
    }

    /// Roots with a queued or running pass.
    pub fn queued_roots(&self) -> Vec<PathBuf> {
        self.inner.queues().keys().cloned().collect()
    }

    fn schedule(&self, root: ProjectRoot, changes: ChangeSet) {
        self.inner.known_roots().insert(root.path.clone());
        let start_worker = {
            let mut queues = self.inner.queues();
            let queue = queues.entry(root.path.clone()).or_default();
            queue.generation += 1;
            let pending = queue
                .pending
                .get_or_insert_with(|| (root.clone(), ChangeSet::default()));
            pending.0 = root.clone();
            pending.1.merge(changes);
            debug!(root = %root.path.display(), generation = queue.generation, "validation queued");
            !std::mem::replace(&mut queue.running, true)
        };

        if start_worker {
            self.inner.busy.send_modify(|workers| *workers += 1);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.drain(&root.path).await;
                inner.busy.send_modify(|workers| *workers -= 1);
            });
        }
    }
}

impl Inner {
    fn published(&self) -> MutexGuard<'_, PublishedDiagnostics> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<PathBuf, RootQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn known_roots(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_superseded(&self, root: &Path, generation: u64) -> bool {
        self.queues()
            .get(root)
            .is_some_and(|queue| queue.generation != generation)
    }

    /// Run queued passes for `root` until nothing is pending.
    async fn drain(&self, root: &Path) {
        loop {
            let (project, changes, generation) = {
                let mut queues = self.queues();
                let Some(queue) = queues.get_mut(root) else {
                    break;
                };
                let generation = queue.generation;
                match queue.pending.take() {
                    Some((project, changes)) => (project, changes, generation),
                    None => {
                        queues.remove(root);
                        break;
                    }
                }
            };

            if let PassResult::Superseded = self.run_pass(&project, &changes, generation).await {
                // No pending set means the project was invalidated meanwhile.
                let mut queues = self.queues();
                if let Some((_, pending)) = queues
                    .get_mut(root)
                    .and_then(|queue| queue.pending.as_mut())
                {
                    pending.merge(changes);
                }
            }
        }
    }

    async fn run_pass(
        &self,
        root: &ProjectRoot,
        changes: &ChangeSet,
        generation: u64,
    ) -> PassResult {
        let (entry, _) = self.cache.get_or_create(root);
        let mut entry = entry.lock().await;
        if self.is_superseded(&root.path, generation) {
            return PassResult::Superseded;
        }

        let overlay = self.overlay.read().await.clone();
        let stale: BTreeMap<SourceKind, Vec<PathBuf>> = {
            let known: Vec<PathBuf> = self.known_roots().iter().cloned().collect();
            let published = self.published();
            SourceKind::ALL
                .into_iter()
                .map(|kind| (kind, published.files_with_kind(&root.path, kind, &known)))
                .filter(|(_, files)| !files.is_empty())
                .collect()
        };
        let superseded = || self.is_superseded(&root.path, generation);
        let cx = PassContext {
            root,
            changes,
            overlay: &overlay,
            stale: &stale,
            superseded: &superseded,
        };

        let pipeline = Pipeline::new(
            &self.matcher,
            self.services.as_ref(),
            &self.settings,
            self.locator.as_ref(),
        );
        let mut map = DiagnosticMap::new();
        match pipeline.run(&cx, &mut entry, &mut map).await {
            Ok(report) => {
                entry.last_report = Some(report);
                entry.passes += 1;
            }
            Err(PassError::Superseded) => return PassResult::Superseded,
            Err(PassError::Unexpected(report)) => {
                error!(root = %root.path.display(), "validation pass failed: {report:?}");
                entry.model_valid = false;
                let message = format!("Internal error while validating this project: {report:#}");
                let mut blamed: Vec<PathBuf> = changes.files().cloned().collect();
                if blamed.is_empty() {
                    blamed.push(self.resolver.marker_path(&root.path));
                }
                for file in &blamed {
                    map.push(
                        file,
                        DiagnosticRecord::error(SourceKind::Internal, TextRange::ZERO, message.clone()),
                    );
                }
            }
        }
        drop(entry);

        if self.is_superseded(&root.path, generation) {
            return PassResult::Superseded;
        }
        self.commit(map).await;
        PassResult::Committed
    }

    async fn commit(&self, map: DiagnosticMap) {
        if map.is_empty() {
            return;
        }
        let touched = self.published().merge(map);
        self.notifier.publish(touched).await;
    }
}
