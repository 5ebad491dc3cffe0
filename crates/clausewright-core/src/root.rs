//! Finding the template project a file belongs to.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::conventions::Conventions;
use crate::overlay::{FileOverlay, read_file_with_overlay};

/// Whether the grammar describes a single clause or a whole contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    Clause,
    Contract,
}

impl FromStr for TemplateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clause" => Ok(TemplateKind::Clause),
            "contract" => Ok(TemplateKind::Contract),
            other => Err(format!("unknown template kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoot {
    /// Directory holding the marker file.
    pub path: PathBuf,
    pub name: Option<String>,
    pub kind: TemplateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootResolution {
    Found(ProjectRoot),
    /// No ancestor directory carried a valid marker; `probed` directories were checked.
    NotFound { probed: usize },
}

#[derive(Debug, Clone)]
pub struct RootResolver {
    marker_file: String,
    project_key: String,
    kind_key: String,
}

impl RootResolver {
    pub fn new(conventions: &Conventions) -> Self {
        Self {
            marker_file: conventions.marker_file.clone(),
            project_key: conventions.project_key.clone(),
            kind_key: conventions.template_kind_key.clone(),
        }
    }

    pub fn marker_file(&self) -> &str {
        &self.marker_file
    }

    pub fn marker_path(&self, root: &Path) -> PathBuf {
        root.join(&self.marker_file)
    }

    /// Walk from the file's directory up to the filesystem root and stop at the
    /// first directory whose marker parses and carries the project key.
    ///
    /// Markers open in the editor are read from their buffer.
    pub async fn resolve(&self, file: &Path, overlay: &FileOverlay) -> RootResolution {
        let mut probed = 0;
        let mut current = file.parent();
        while let Some(dir) = current {
            probed += 1;
            let marker = self.marker_path(dir);
            if let Ok(text) = read_file_with_overlay(&marker, overlay).await
                && let Some((name, kind)) = self.parse_marker(&marker, &text)
            {
                debug!(file = %file.display(), root = %dir.display(), "resolved template root");
                return RootResolution::Found(ProjectRoot {
                    path: dir.to_path_buf(),
                    name,
                    kind,
                });
            }
            current = dir.parent();
        }
        RootResolution::NotFound { probed }
    }

    /// Name and template kind of a marker, or `None` when it does not mark a project.
    pub fn parse_marker(&self, marker: &Path, text: &str) -> Option<(Option<String>, TemplateKind)> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(marker = %marker.display(), error = %e, "marker is not valid JSON");
                return None;
            }
        };
        let project = value.get(&self.project_key)?;
        let kind = match project.get(&self.kind_key).and_then(|v| v.as_str()) {
            Some(tag) => tag.parse::<TemplateKind>().unwrap_or_else(|e: String| {
                warn!(marker = %marker.display(), "{e}, assuming clause");
                TemplateKind::Clause
            }),
            None => TemplateKind::default(),
        };
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        Some((name, kind))
    }
}
