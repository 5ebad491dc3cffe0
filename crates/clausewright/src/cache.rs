//! Warm collaborator handles per template project.

use clausewright_core::{
    CompiledTemplate, Formula, LogicManager, ModelManager, ProjectRoot, ServiceFactory,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::pipeline::PassReport;

pub struct ProjectCacheEntry {
    pub root: ProjectRoot,
    pub model_manager: Box<dyn ModelManager>,
    pub logic_manager: Box<dyn LogicManager>,
    pub template: Option<Arc<dyn CompiledTemplate>>,
    /// Formulas last registered with the logic manager.
    pub formulas: Vec<Formula>,
    /// Last successful parse of each sample file.
    pub parses: BTreeMap<PathBuf, serde_json::Value>,
    /// Models loaded and validated in the most recent pass.
    pub model_valid: bool,
    pub last_report: Option<PassReport>,
    /// Committed passes so far; zero means the next pass checks everything.
    pub passes: u64,
}

impl ProjectCacheEntry {
    fn new(root: &ProjectRoot, services: &dyn ServiceFactory) -> Self {
        Self {
            root: root.clone(),
            model_manager: services.model_manager(root),
            logic_manager: services.logic_manager(root),
            template: None,
            formulas: Vec::new(),
            parses: BTreeMap::new(),
            model_valid: false,
            last_report: None,
            passes: 0,
        }
    }

    /// The compiled template went stale; so did everything parsed with it.
    pub fn drop_template(&mut self) {
        self.template = None;
        self.parses.clear();
    }
}

/// Shared handle; holding the lock is the exclusive access a pass needs.
pub type SharedEntry = Arc<tokio::sync::Mutex<ProjectCacheEntry>>;

struct Slot {
    entry: SharedEntry,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<PathBuf, Slot>,
    tick: u64,
}

pub struct ProjectCache {
    services: Arc<dyn ServiceFactory>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl ProjectCache {
    pub fn new(services: Arc<dyn ServiceFactory>, capacity: usize) -> Self {
        Self {
            services,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry for `root`, created with fresh collaborators when absent.
    /// The flag tells whether it was just created.
    pub fn get_or_create(&self, root: &ProjectRoot) -> (SharedEntry, bool) {
        let mut state = self.state();
        state.tick += 1;
        let tick = state.tick;

        if let Some(slot) = state.slots.get_mut(&root.path) {
            slot.last_used = tick;
            return (slot.entry.clone(), false);
        }

        debug!(root = %root.path.display(), "creating project cache entry");
        let entry = Arc::new(tokio::sync::Mutex::new(ProjectCacheEntry::new(
            root,
            self.services.as_ref(),
        )));
        state.slots.insert(
            root.path.clone(),
            Slot {
                entry: entry.clone(),
                last_used: tick,
            },
        );

        while state.slots.len() > self.capacity {
            let Some(oldest) = state
                .slots
                .iter()
                .filter(|(path, _)| **path != root.path)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(path, _)| path.clone())
            else {
                break;
            };
            debug!(root = %oldest.display(), "evicting least recently used project");
            state.slots.remove(&oldest);
        }

        (entry, true)
    }

    pub fn get(&self, root: &Path) -> Option<SharedEntry> {
        let mut state = self.state();
        state.tick += 1;
        let tick = state.tick;
        state.slots.get_mut(root).map(|slot| {
            slot.last_used = tick;
            slot.entry.clone()
        })
    }

    pub fn invalidate(&self, root: &Path) -> bool {
        self.state().slots.remove(root).is_some()
    }

    pub fn evict_all(&self) -> usize {
        let mut state = self.state();
        let count = state.slots.len();
        state.slots.clear();
        count
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.state().slots.keys().cloned().collect();
        roots.sort();
        roots
    }

    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
