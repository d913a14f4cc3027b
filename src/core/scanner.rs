use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::settings::Settings;
use crate::error::ScanError;
use crate::models::scan_result::DirectResult;

use super::progress::RunProgress;

/// Directory reads allowed in flight at once across both walks.
const MAX_CONCURRENT_READS: usize = 32;

/// Walks configured movie and series roots directly on disk.
pub struct FilesystemScanner {
    semaphore: Arc<Semaphore>,
    rules: Arc<MatchRules>,
    progress: Arc<RunProgress>,
}

/// Filename heuristics shared by every walk.
#[derive(Debug, Clone)]
pub struct MatchRules {
    video_extensions: Vec<String>,
    ignore_dir_names: Vec<String>,
    skip_name_keywords: Vec<String>,
}

impl MatchRules {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            video_extensions: lowercase_all(&settings.video_extensions),
            ignore_dir_names: settings.ignore_dir_names.clone(),
            skip_name_keywords: lowercase_all(&settings.skip_name_keywords),
        }
    }

    pub fn is_video_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_lowercase(),
            None => return false,
        };
        if !self.video_extensions.contains(&ext) {
            return false;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        !self.skip_name_keywords.iter().any(|k| stem.contains(k.as_str()))
    }

    pub fn is_ignored_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.ignore_dir_names.iter().any(|d| d == name)
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim_start_matches('.').to_lowercase())
        .collect()
}

struct DirEntryData {
    path: PathBuf,
    name: String,
    is_dir: bool,
    is_file: bool,
}

/// Read all entries of a directory in one blocking call. Only a failure to
/// read the directory itself is fatal to the scan; entries that cannot be
/// inspected, such as dangling symlinks, are skipped.
fn read_dir_batch(dir_path: &Path) -> Result<Vec<DirEntryData>, ScanError> {
    let read_err = |source| ScanError::ReadDir {
        path: dir_path.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry_result in std::fs::read_dir(dir_path).map_err(read_err)? {
        let entry = entry_result.map_err(read_err)?;
        let path = entry.path();
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => match std::fs::metadata(&path) {
                // Linked library folders are walked too.
                Ok(target) => target,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unresolvable symlink");
                    continue;
                }
            },
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        entries.push(DirEntryData {
            name: entry.file_name().to_string_lossy().to_string(),
            path,
            is_dir: metadata.is_dir(),
            is_file: metadata.is_file(),
        });
    }
    Ok(entries)
}

/// Mark `dir` as walked. Returns `false` when its real path was already
/// walked in this root, which happens when a symlink points back up the tree.
fn enter_dir(dir: &Path, visited: &DashSet<PathBuf>) -> Result<bool, ScanError> {
    let real = std::fs::canonicalize(dir).map_err(|source| ScanError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(visited.insert(real))
}

impl FilesystemScanner {
    pub fn new(settings: &Settings, progress: Arc<RunProgress>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_READS)),
            rules: Arc::new(MatchRules::from_settings(settings)),
            progress,
        }
    }

    /// Walk movie and series roots concurrently and join both before returning.
    pub async fn scan(
        &self,
        movie_roots: &[PathBuf],
        series_roots: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<DirectResult, ScanError> {
        info!(
            movie_roots = movie_roots.len(),
            series_roots = series_roots.len(),
            "Filesystem scan started"
        );
        let (movies, series) = tokio::try_join!(
            self.list_movies_under(movie_roots, cancel),
            self.list_series_dirs_under(series_roots, cancel),
        )?;

        for (root, dirs) in &series {
            for (i, dir) in dirs.iter().enumerate() {
                debug!(root = %root.display(), index = i, series = %dir.display(), "Series directory");
            }
        }

        let result = DirectResult { movies, series };
        info!(
            movies = result.movie_count(),
            series = result.series_count(),
            "Filesystem scan finished"
        );
        Ok(result)
    }

    /// Every movie file beneath each root, recursively.
    pub async fn list_movies_under(
        &self,
        roots: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<PathBuf, Vec<PathBuf>>, ScanError> {
        let mut out = BTreeMap::new();
        for root in roots {
            let mut files = walk_movies(
                root.clone(),
                Arc::clone(&self.semaphore),
                Arc::clone(&self.rules),
                Arc::clone(&self.progress),
                Arc::new(DashSet::new()),
                cancel.clone(),
            )
            .await?;
            files.sort();
            out.insert(root.clone(), files);
        }
        Ok(out)
    }

    /// First-level child directories of each series root.
    pub async fn list_series_dirs_under(
        &self,
        roots: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<PathBuf, Vec<PathBuf>>, ScanError> {
        let mut out = BTreeMap::new();
        for root in roots {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let entries = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| ScanError::Cancelled)?;
                let root_clone = root.clone();
                tokio::task::spawn_blocking(move || read_dir_batch(&root_clone)).await??
            };
            let mut dirs: Vec<PathBuf> = entries
                .into_iter()
                .filter(|e| e.is_dir && !self.rules.is_ignored_dir(&e.name))
                .map(|e| e.path)
                .collect();
            dirs.sort();
            self.progress.add_series(dirs.len());
            out.insert(root.clone(), dirs);
        }
        Ok(out)
    }
}

fn walk_movies(
    path: PathBuf,
    semaphore: Arc<Semaphore>,
    rules: Arc<MatchRules>,
    progress: Arc<RunProgress>,
    visited: Arc<DashSet<PathBuf>>,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<Vec<PathBuf>, ScanError>> + Send>> {
    Box::pin(async move {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        // Permit is held only during I/O, then released before descending.
        let entries = {
            let _permit = semaphore.acquire().await.map_err(|_| ScanError::Cancelled)?;
            let path_clone = path.clone();
            let visited = Arc::clone(&visited);
            tokio::task::spawn_blocking(move || {
                if !enter_dir(&path_clone, &visited)? {
                    return Ok::<_, ScanError>(None);
                }
                read_dir_batch(&path_clone).map(Some)
            })
            .await??
        };
        let Some(entries) = entries else {
            warn!(path = %path.display(), "Symlink cycle detected, not descending");
            return Ok(Vec::new());
        };

        let mut handles = Vec::new();
        let mut files = Vec::new();

        for entry in entries {
            if entry.is_dir {
                if rules.is_ignored_dir(&entry.name) {
                    continue;
                }
                handles.push(tokio::spawn(walk_movies(
                    entry.path,
                    Arc::clone(&semaphore),
                    Arc::clone(&rules),
                    Arc::clone(&progress),
                    Arc::clone(&visited),
                    cancel.clone(),
                )));
            } else if entry.is_file && rules.is_video_file(&entry.path) {
                debug!(path = %entry.path.display(), "Movie file");
                progress.add_movies(1);
                files.push(entry.path);
            }
        }

        for handle in handles {
            files.extend(handle.await??);
        }

        Ok(files)
    })
}
