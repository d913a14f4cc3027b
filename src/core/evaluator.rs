use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::settings::Settings;
use crate::error::EvaluateError;
use crate::models::series::{EpisodeInfo, SeriesInfo, SeriesNeed};

use super::episode::parse_episode_path;
use super::scanner::MatchRules;

/// Decides whether a video needs a subtitle download, without downloading.
#[async_trait]
pub trait SubtitleNeedEvaluator: Send + Sync {
    /// True when no acceptable subtitle exists, or always when `forced`.
    async fn movie_needs_download(&self, path: &Path, forced: bool) -> bool;

    /// Per-episode need list for a series directory. With `quick_check_only`
    /// the walk stops at the first episode that needs a subtitle.
    async fn series_needs_download(
        &self,
        series_dir: &Path,
        forced: bool,
        quick_check_only: bool,
    ) -> Result<SeriesNeed, EvaluateError>;
}

#[derive(Debug, Clone)]
struct SubtitleRules {
    extensions: Vec<String>,
    language_markers: Vec<String>,
    window: Option<Duration>,
}

/// Looks for target-language subtitle files next to each video.
#[derive(Debug, Clone)]
pub struct LocalSubtitleEvaluator {
    subs: Arc<SubtitleRules>,
    videos: Arc<MatchRules>,
}

impl LocalSubtitleEvaluator {
    pub fn new(settings: &Settings) -> Self {
        let days = settings.subtitle.download_within_days;
        Self {
            subs: Arc::new(SubtitleRules {
                extensions: lower(&settings.subtitle.extensions),
                language_markers: lower(&settings.subtitle.language_markers),
                window: (days > 0).then(|| Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
            }),
            videos: Arc::new(MatchRules::from_settings(settings)),
        }
    }
}

fn lower(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim_start_matches('.').to_lowercase())
        .collect()
}

impl SubtitleRules {
    /// `name` belongs to `video_stem` and is a target-language subtitle, or an
    /// untagged one.
    fn is_acceptable(&self, video_stem: &str, name: &str) -> bool {
        let name = name.to_lowercase();
        let stem = video_stem.to_lowercase();
        let Some(rest) = name.strip_prefix(&stem) else {
            return false;
        };
        let Some((middle, ext)) = rest.rsplit_once('.') else {
            return false;
        };
        if !self.extensions.iter().any(|e| e == ext) {
            return false;
        }
        if middle.is_empty() {
            return true;
        }
        if !middle.starts_with('.') && !middle.starts_with('_') && !middle.starts_with('-') {
            // `Movie 2.srt` is not a subtitle of `Movie.mkv`.
            return false;
        }
        middle
            .split(['.', '_', '-', ' ', '[', ']', '(', ')'])
            .filter(|seg| !seg.is_empty())
            .any(|seg| self.language_markers.iter().any(|m| segment_matches(seg, m)))
    }

    fn is_recent(&self, modified: Option<SystemTime>) -> bool {
        let (Some(window), Some(modified)) = (self.window, modified) else {
            return true;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age <= window,
            Err(_) => true,
        }
    }
}

/// `chs` matches `chs` and `chs&eng`, but `chi` does not match `chips`.
fn segment_matches(segment: &str, marker: &str) -> bool {
    match segment.strip_prefix(marker) {
        Some(rest) => !rest.starts_with(|c: char| c.is_alphabetic()),
        None => false,
    }
}

fn has_acceptable_subtitle(rules: &SubtitleRules, video: &Path) -> std::io::Result<bool> {
    let (Some(dir), Some(stem)) = (video.parent(), video.file_stem()) else {
        return Ok(false);
    };
    let stem = stem.to_string_lossy();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if rules.is_acceptable(&stem, &name) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Blocking body of [`LocalSubtitleEvaluator::movie_needs_download`].
fn movie_needs(rules: &SubtitleRules, path: &Path) -> bool {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    if !rules.is_recent(modified) {
        debug!(path = %path.display(), "Skipping video outside the download window");
        return false;
    }
    match has_acceptable_subtitle(rules, path) {
        Ok(found) => !found,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not look for existing subtitles");
            false
        }
    }
}

fn collect_videos(
    dir: &Path,
    videos: &MatchRules,
    out: &mut Vec<PathBuf>,
) -> Result<(), EvaluateError> {
    let read_err = |source| EvaluateError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(read_err)?;
        let name = entry.file_name();
        if file_type.is_dir() {
            if !videos.is_ignored_dir(&name.to_string_lossy()) {
                collect_videos(&path, videos, out)?;
            }
        } else if videos.is_video_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Blocking body of [`LocalSubtitleEvaluator::series_needs_download`].
fn series_needs(
    subs: &SubtitleRules,
    videos: &MatchRules,
    series_dir: &Path,
    forced: bool,
    quick_check_only: bool,
) -> Result<SeriesNeed, EvaluateError> {
    let mut files = Vec::new();
    collect_videos(series_dir, videos, &mut files)?;
    files.sort();

    let mut info = SeriesInfo {
        name: series_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        dir_path: series_dir.to_path_buf(),
        ..Default::default()
    };

    for file in files {
        let Some(parsed) = parse_episode_path(&file) else {
            debug!(path = %file.display(), "No season/episode in file name");
            continue;
        };
        let episode = EpisodeInfo {
            title: parsed.title,
            file_path: file,
            season: parsed.season,
            episode: parsed.episode,
        };
        let needed = forced || movie_needs(subs, &episode.file_path);
        info.episodes.push(episode.clone());
        if needed {
            info.need_download.push(episode);
            if quick_check_only {
                break;
            }
        }
    }

    Ok(SeriesNeed {
        needed: !info.need_download.is_empty(),
        info,
    })
}

#[async_trait]
impl SubtitleNeedEvaluator for LocalSubtitleEvaluator {
    async fn movie_needs_download(&self, path: &Path, forced: bool) -> bool {
        if forced {
            return true;
        }
        let rules = Arc::clone(&self.subs);
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || movie_needs(&rules, &path)).await {
            Ok(needed) => needed,
            Err(e) => {
                warn!(error = %e, "Subtitle check task failed");
                false
            }
        }
    }

    async fn series_needs_download(
        &self,
        series_dir: &Path,
        forced: bool,
        quick_check_only: bool,
    ) -> Result<SeriesNeed, EvaluateError> {
        let subs = Arc::clone(&self.subs);
        let videos = Arc::clone(&self.videos);
        let dir = series_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            series_needs(&subs, &videos, &dir, forced, quick_check_only)
        })
        .await?
    }
}
