//! Where a template project keeps its files.
//!
//! The layout (marker file, model directory, logic directory, grammar and sample
//! names) is data, not code: [`Conventions`] is deserialized from the
//! configuration and compiled into a [`ConventionMatcher`] once at startup.

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::overlay::FileOverlay;

/// Directories never worth descending into while discovering project files.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Conventions {
    /// File whose presence (with `project_key`) marks a template root.
    pub marker_file: String,
    /// Top-level JSON key the marker must carry.
    pub project_key: String,
    /// Key inside `project_key` naming the template kind.
    pub template_kind_key: String,
    pub model_globs: Vec<String>,
    pub logic_globs: Vec<String>,
    pub grammar_globs: Vec<String>,
    pub sample_globs: Vec<String>,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            marker_file: "package.json".to_owned(),
            project_key: "accordproject".to_owned(),
            template_kind_key: "template".to_owned(),
            model_globs: vec!["model/**/*.cto".to_owned()],
            logic_globs: vec!["logic/**/*.ergo".to_owned()],
            grammar_globs: vec!["text/grammar.tem.md".to_owned()],
            sample_globs: vec!["text/sample*.md".to_owned()],
        }
    }
}

impl Conventions {
    /// Workspace-relative globs covering every file a project is made of,
    /// for editors that watch the filesystem on our behalf.
    pub fn watch_globs(&self) -> Vec<String> {
        std::iter::once(&self.marker_file)
            .chain(&self.model_globs)
            .chain(&self.logic_globs)
            .chain(&self.grammar_globs)
            .chain(&self.sample_globs)
            .map(|glob| format!("**/{}", glob.trim_start_matches("./")))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Role of a file inside a template project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Marker,
    Model,
    Logic,
    Grammar,
    Sample,
    Other,
}

impl FileKind {
    pub const DISCOVERABLE: [FileKind; 4] = [
        FileKind::Model,
        FileKind::Logic,
        FileKind::Grammar,
        FileKind::Sample,
    ];
}

/// Root-relative globs plus the same globs reduced to their file-name part,
/// so an edited file is recognized even outside the conventional directory.
#[derive(Debug, Clone)]
struct KindMatcher {
    relative: GlobSet,
    by_name: GlobSet,
}

impl KindMatcher {
    fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut relative = GlobSetBuilder::new();
        let mut by_name = GlobSetBuilder::new();
        for pattern in patterns {
            relative.add(
                GlobBuilder::new(pattern)
                    .literal_separator(true)
                    .build()?,
            );
            let name = pattern.rsplit('/').next().unwrap_or(pattern);
            by_name.add(Glob::new(name)?);
        }
        Ok(Self {
            relative: relative.build()?,
            by_name: by_name.build()?,
        })
    }

    fn matches_relative(&self, relative: &Path) -> bool {
        self.relative.is_match(relative)
    }

    fn matches_name(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| self.by_name.is_match(Path::new(name)))
    }
}

#[derive(Debug, Clone)]
pub struct ConventionMatcher {
    conventions: Conventions,
    model: KindMatcher,
    logic: KindMatcher,
    grammar: KindMatcher,
    sample: KindMatcher,
}

impl ConventionMatcher {
    pub fn new(conventions: Conventions) -> Result<Self, globset::Error> {
        Ok(Self {
            model: KindMatcher::new(&conventions.model_globs)?,
            logic: KindMatcher::new(&conventions.logic_globs)?,
            grammar: KindMatcher::new(&conventions.grammar_globs)?,
            sample: KindMatcher::new(&conventions.sample_globs)?,
            conventions,
        })
    }

    pub fn conventions(&self) -> &Conventions {
        &self.conventions
    }

    fn matcher(&self, kind: FileKind) -> Option<&KindMatcher> {
        match kind {
            FileKind::Model => Some(&self.model),
            FileKind::Logic => Some(&self.logic),
            FileKind::Grammar => Some(&self.grammar),
            FileKind::Sample => Some(&self.sample),
            FileKind::Marker | FileKind::Other => None,
        }
    }

    fn is_marker(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| name == self.conventions.marker_file.as_str())
    }

    /// Classify a file belonging to the project at `root`.
    ///
    /// Grammar is checked before samples since both are markdown.
    pub fn classify(&self, root: &Path, path: &Path) -> FileKind {
        if self.is_marker(path) && path.parent() == Some(root) {
            return FileKind::Marker;
        }
        let relative = path.strip_prefix(root).ok();
        let order = [
            FileKind::Grammar,
            FileKind::Sample,
            FileKind::Model,
            FileKind::Logic,
        ];
        for kind in order {
            if let Some(rel) = relative
                && self.matcher(kind).is_some_and(|m| m.matches_relative(rel))
            {
                return kind;
            }
        }
        order
            .into_iter()
            .find(|&kind| self.matcher(kind).is_some_and(|m| m.matches_name(path)))
            .unwrap_or(FileKind::Other)
    }

    /// Whether an editor event about `path` can concern a template project at all.
    pub fn is_candidate(&self, path: &Path) -> bool {
        self.is_marker(path)
            || FileKind::DISCOVERABLE
                .into_iter()
                .any(|kind| self.matcher(kind).is_some_and(|m| m.matches_name(path)))
    }

    /// All files of `kind` under `root`, on disk or open in the editor, sorted.
    pub fn discover(&self, root: &Path, kind: FileKind, overlay: &FileOverlay) -> Vec<PathBuf> {
        let Some(matcher) = self.matcher(kind) else {
            return Vec::new();
        };
        let mut found = BTreeSet::new();

        let walker = WalkBuilder::new(root)
            .follow_links(true)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_none_or(|name| !SKIPPED_DIRS.contains(&name))
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(root = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if let Ok(relative) = path.strip_prefix(root)
                && matcher.matches_relative(relative)
            {
                found.insert(path.to_path_buf());
            }
        }

        // Unsaved buffers that do not exist on disk yet.
        for path in overlay.keys() {
            if let Ok(relative) = path.strip_prefix(root)
                && matcher.matches_relative(relative)
            {
                found.insert(path.clone());
            }
        }

        found.into_iter().collect()
    }

    /// Extension of the first logic glob (`ergo` by default), used to spot logic
    /// file paths inside verbose compiler messages.
    pub fn logic_extension(&self) -> Option<&str> {
        self.conventions
            .logic_globs
            .iter()
            .find_map(|glob| glob.rsplit_once("*.").map(|(_, ext)| ext))
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
    }
}
