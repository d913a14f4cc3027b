use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::job::DEFAULT_PRIORITY;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub movie_paths: Vec<PathBuf>,
    pub series_paths: Vec<PathBuf>,
    pub video_extensions: Vec<String>,
    pub ignore_dir_names: Vec<String>,
    pub skip_name_keywords: Vec<String>,
    pub subtitle: SubtitleSettings,
    pub media_server: MediaServerSettings,
    pub executor: ExecutorSettings,
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs_cache_dir().unwrap_or_else(|| PathBuf::from(".subsweep"));

        Self {
            movie_paths: vec![],
            series_paths: vec![],
            video_extensions: [
                "mp4", "mkv", "avi", "rmvb", "iso", "m2ts", "ts", "wmv", "mov", "m4v", "flv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignore_dir_names: ["@eaDir", "extrafanart", ".actors", "$RECYCLE.BIN", "lost+found"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip_name_keywords: vec!["sample".to_string(), "trailer".to_string()],
            subtitle: SubtitleSettings::default(),
            media_server: MediaServerSettings::default(),
            executor: ExecutorSettings::default(),
            data_dir,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let settings = serde_json::from_slice(&bytes)?;
        Ok(settings)
    }

    /// Catalog mode runs only when the media server integration is enabled.
    pub fn catalog_mode(&self) -> bool {
        self.media_server.enable
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.task_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleSettings {
    pub extensions: Vec<String>,
    /// Name segments that mark a subtitle as being in the target language.
    pub language_markers: Vec<String>,
    /// Only videos modified within this many days are considered; 0 disables the window.
    pub download_within_days: u32,
    pub priority: i32,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            extensions: ["srt", "ass", "ssa", "sub", "vtt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            language_markers: ["zh", "chs", "cht", "chi", "chinese", "zho", "chn"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            download_within_days: 90,
            priority: DEFAULT_PRIORITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaServerSettings {
    pub enable: bool,
    pub address: String,
    pub api_key: String,
    pub max_request_video_number: u32,
    /// Limit used instead of `max_request_video_number` in forced mode.
    pub forced_max_request_video_number: u32,
}

impl Default for MediaServerSettings {
    fn default() -> Self {
        Self {
            enable: false,
            address: String::new(),
            api_key: String::new(),
            max_request_video_number: 500,
            forced_max_request_video_number: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub task_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout_secs: 300,
        }
    }
}

/// Per-run values that shadow the base settings without mutating them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub max_request_video_number: Option<u32>,
}

/// Immutable settings view for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    base: Arc<Settings>,
    overrides: RunOverrides,
    forced: bool,
}

impl RunSettings {
    pub fn new(base: Arc<Settings>, forced: bool) -> Self {
        let overrides = if forced {
            RunOverrides {
                max_request_video_number: Some(base.media_server.forced_max_request_video_number),
            }
        } else {
            RunOverrides::default()
        };
        Self {
            base,
            overrides,
            forced,
        }
    }

    pub fn base(&self) -> &Settings {
        &self.base
    }

    pub fn forced(&self) -> bool {
        self.forced
    }

    pub fn media_server_limit(&self) -> u32 {
        self.overrides
            .max_request_video_number
            .unwrap_or(self.base.media_server.max_request_video_number)
    }
}

fn dirs_cache_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join("Library/Caches/subsweep"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
            .map(|p| p.join("subsweep"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Some(PathBuf::from(".subsweep"))
    }
}
