use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Dequeued before [`DEFAULT_PRIORITY`] jobs.
pub const HIGH_PRIORITY: i32 = 3;
pub const DEFAULT_PRIORITY: i32 = 5;
pub const LOW_PRIORITY: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VideoKind {
    Movie,
    Series,
}

impl fmt::Display for VideoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoKind::Movie => f.write_str("Movie"),
            VideoKind::Series => f.write_str("Series"),
        }
    }
}

/// One video item that needs a subtitle fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub kind: VideoKind,
    pub physical_path: PathBuf,
    /// Lower values are consumed first.
    pub priority: i32,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub series_root_dir: Option<PathBuf>,
    /// Media-server item id, when the job came from catalog mode.
    pub external_id: Option<String>,
}

impl Job {
    pub fn movie(physical_path: impl Into<PathBuf>, priority: i32) -> Self {
        Self {
            kind: VideoKind::Movie,
            physical_path: physical_path.into(),
            priority,
            season: None,
            episode: None,
            series_root_dir: None,
            external_id: None,
        }
    }

    pub fn episode(
        physical_path: impl Into<PathBuf>,
        priority: i32,
        season: u32,
        episode: u32,
        series_root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: VideoKind::Series,
            physical_path: physical_path.into(),
            priority,
            season: Some(season),
            episode: Some(episode),
            series_root_dir: Some(series_root_dir.into()),
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            kind: self.kind,
            physical_path: self.physical_path.clone(),
            season: self.season,
            episode: self.episode,
        }
    }
}

/// Deduplication identity of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub kind: VideoKind,
    pub physical_path: PathBuf,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}
