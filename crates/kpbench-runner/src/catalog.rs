//! Job discovery over a `root/<group>/<size>/<type>/<file>.<ext>` tree.
//!
//! Listing failures never abort discovery: the affected subtree is dropped,
//! the error is logged and recorded in [`Catalog::diagnostics`].

use crate::model::Job;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Order in which directory entries are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingOrder {
    /// Entries sorted by file name; identical on every filesystem.
    #[default]
    Lexicographic,
    /// Whatever order the filesystem returns. Picking the "first" type
    /// directory is then platform dependent.
    FirstFound,
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub sizes_per_group: usize,
    pub size_prefix: String,
    pub extension: String,
    pub order: ListingOrder,
    pub time_budget: Duration,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            sizes_per_group: 5,
            size_prefix: "n".to_string(),
            extension: "kp".to_string(),
            order: ListingOrder::default(),
            time_budget: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGroup {
    pub name: String,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDiagnostic {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub groups: Vec<JobGroup>,
    pub diagnostics: Vec<CatalogDiagnostic>,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.jobs.is_empty())
    }

    pub fn job_count(&self) -> usize {
        self.groups.iter().map(|g| g.jobs.len()).sum()
    }

    /// All jobs in submission order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.groups.iter().flat_map(|g| g.jobs.iter())
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.groups.into_iter().flat_map(|g| g.jobs).collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

pub fn discover(root: &Path, opts: &CatalogOptions) -> Catalog {
    let mut catalog = Catalog::default();
    let groups = list_entries(root, EntryKind::Dir, opts.order, &mut catalog.diagnostics);

    for (group, group_path) in groups {
        let mut jobs = Vec::new();
        for (size, size_path) in select_sizes(&group_path, opts, &mut catalog.diagnostics) {
            let type_dirs =
                list_entries(&size_path, EntryKind::Dir, opts.order, &mut catalog.diagnostics);
            let Some((_, type_path)) = type_dirs.into_iter().next() else {
                debug!(target: "kpbench::catalog", path = %size_path.display(), "no type directory; skipping size");
                continue;
            };
            let files =
                list_entries(&type_path, EntryKind::File, opts.order, &mut catalog.diagnostics);
            let Some((_, file_path)) = files
                .into_iter()
                .find(|(name, _)| has_extension(name, &opts.extension))
            else {
                debug!(target: "kpbench::catalog", path = %type_path.display(), ext = %opts.extension, "no problem file; skipping size");
                continue;
            };
            jobs.push(Job {
                group: group.clone(),
                size_label: size,
                relative_path: relative_display(root, &file_path),
                source_path: file_path,
                time_budget: opts.time_budget,
            });
        }
        if jobs.is_empty() {
            debug!(target: "kpbench::catalog", group = %group, "group has no runnable sizes; dropped");
            continue;
        }
        catalog.groups.push(JobGroup { name: group, jobs });
    }
    catalog
}

fn select_sizes(
    group_path: &Path,
    opts: &CatalogOptions,
    diagnostics: &mut Vec<CatalogDiagnostic>,
) -> Vec<(String, PathBuf)> {
    let mut sizes: Vec<(String, PathBuf)> =
        list_entries(group_path, EntryKind::Dir, opts.order, diagnostics)
            .into_iter()
            .filter(|(name, _)| name.starts_with(&opts.size_prefix))
            .collect();
    // Stable sort: ties keep listing order.
    sizes.sort_by_key(|(name, _)| size_key(name, &opts.size_prefix));
    sizes.truncate(opts.sizes_per_group);
    sizes
}

/// Numeric suffix after the prefix; anything non-numeric sorts as 0.
pub fn size_key(name: &str, prefix: &str) -> u64 {
    let suffix = name.strip_prefix(prefix).unwrap_or("");
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return 0;
    }
    suffix.parse().unwrap_or(u64::MAX)
}

fn has_extension(name: &str, ext: &str) -> bool {
    name.strip_suffix(ext)
        .map(|stem| stem.ends_with('.'))
        .unwrap_or(false)
}

fn list_entries(
    dir: &Path,
    kind: EntryKind,
    order: ListingOrder,
    diagnostics: &mut Vec<CatalogDiagnostic>,
) -> Vec<(String, PathBuf)> {
    let mut walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true);
    if order == ListingOrder::Lexicographic {
        walker = walker.sort_by_file_name();
    }
    let mut out = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(dir).to_path_buf();
                warn!(target: "kpbench::catalog", path = %path.display(), error = %e, "directory listing failed");
                diagnostics.push(CatalogDiagnostic {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let matches = match kind {
            EntryKind::Dir => entry.file_type().is_dir(),
            EntryKind::File => entry.file_type().is_file(),
        };
        if !matches {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        out.push((name.to_string(), entry.into_path()));
    }
    out
}

fn relative_display(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
