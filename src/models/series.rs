use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub title: String,
    pub file_path: PathBuf,
    pub season: u32,
    pub episode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub name: String,
    pub dir_path: PathBuf,
    /// Every episode video found under the series directory.
    pub episodes: Vec<EpisodeInfo>,
    /// Episodes lacking an acceptable subtitle.
    pub need_download: Vec<EpisodeInfo>,
}

/// Answer of a series evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesNeed {
    pub needed: bool,
    pub info: SeriesInfo,
}
