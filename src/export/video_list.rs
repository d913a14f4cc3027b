//! Path-to-URL video listing for a reporting layer that serves the
//! library over HTTP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::core::evaluator::SubtitleNeedEvaluator;
use crate::models::scan_result::ScanResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieInfo {
    pub name: String,
    pub dir_root_url: String,
    pub video_path: PathBuf,
    pub video_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneVideoInfo {
    pub name: String,
    pub video_path: PathBuf,
    pub video_url: String,
    pub season: u32,
    pub episode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonInfo {
    pub name: String,
    pub root_dir_path: PathBuf,
    pub dir_root_url: String,
    pub videos: Vec<OneVideoInfo>,
}

/// Swap the `root` prefix of `path` for `url`. `None` when `path` is not under `root`.
fn to_url(path: &Path, root: &Path, url: &str) -> Option<String> {
    let rest = path.strip_prefix(root).ok()?;
    let mut out = url.trim_end_matches('/').to_string();
    for part in rest.components() {
        out.push('/');
        out.push_str(&part.as_os_str().to_string_lossy());
    }
    Some(out)
}

fn parent_url(url: &str) -> String {
    match url.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

/// Build the movie and series listings of a filesystem scan. Library roots
/// missing from `path_url_map` are left out, as are series with nothing to
/// download. A catalog scan yields two empty lists.
pub async fn scrabble_up_video_list(
    result: &ScanResult,
    path_url_map: &HashMap<PathBuf, String>,
    evaluator: &dyn SubtitleNeedEvaluator,
    forced: bool,
) -> (Vec<MovieInfo>, Vec<SeasonInfo>) {
    let mut movies = Vec::new();
    let mut seasons = Vec::new();
    let Some(direct) = result.as_direct() else {
        return (movies, seasons);
    };

    for (root, files) in &direct.movies {
        let Some(url) = path_url_map.get(root) else {
            debug!(root = %root.display(), "No URL for movie root");
            continue;
        };
        for file in files {
            let Some(video_url) = to_url(file, root, url) else {
                continue;
            };
            movies.push(MovieInfo {
                name: video_url.rsplit('/').next().unwrap_or_default().to_string(),
                dir_root_url: parent_url(&video_url),
                video_path: file.clone(),
                video_url,
            });
        }
    }

    for (root, series_dirs) in &direct.series {
        let Some(url) = path_url_map.get(root) else {
            debug!(root = %root.display(), "No URL for series root");
            continue;
        };
        for dir in series_dirs {
            let need = match evaluator.series_needs_download(dir, forced, false).await {
                Ok(need) => need,
                Err(e) => {
                    error!(series = %dir.display(), error = %e, "Series evaluation failed");
                    continue;
                }
            };
            if !need.needed {
                continue;
            }
            let videos = need
                .info
                .episodes
                .iter()
                .filter_map(|ep| {
                    Some(OneVideoInfo {
                        name: ep.title.clone(),
                        video_path: ep.file_path.clone(),
                        video_url: to_url(&ep.file_path, root, url)?,
                        season: ep.season,
                        episode: ep.episode,
                    })
                })
                .collect();
            seasons.push(SeasonInfo {
                name: need.info.name,
                root_dir_path: dir.clone(),
                dir_root_url: to_url(dir, root, url).unwrap_or_else(|| url.clone()),
                videos,
            });
        }
    }

    (movies, seasons)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_url_replaces_root_prefix() {
        let url = to_url(
            Path::new("/media/movies/A/a.mkv"),
            Path::new("/media/movies"),
            "http://host/movies/",
        );
        assert_eq!(url.as_deref(), Some("http://host/movies/A/a.mkv"));
        assert_eq!(parent_url("http://host/movies/A/a.mkv"), "http://host/movies/A");
    }

    #[test]
    fn test_to_url_outside_root() {
        assert!(to_url(Path::new("/other/a.mkv"), Path::new("/media"), "http://h").is_none());
    }
}
