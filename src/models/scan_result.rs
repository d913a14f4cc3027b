use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which source produced a [`ScanResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    Filesystem,
    Catalog,
}

/// Outcome of the scan stage. Exactly one source is populated per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanResult {
    Direct(DirectResult),
    Catalog(CatalogResult),
}

impl ScanResult {
    pub fn mode(&self) -> ScanMode {
        match self {
            ScanResult::Direct(_) => ScanMode::Filesystem,
            ScanResult::Catalog(_) => ScanMode::Catalog,
        }
    }

    pub fn as_direct(&self) -> Option<&DirectResult> {
        match self {
            ScanResult::Direct(direct) => Some(direct),
            ScanResult::Catalog(_) => None,
        }
    }

    pub fn as_catalog(&self) -> Option<&CatalogResult> {
        match self {
            ScanResult::Catalog(catalog) => Some(catalog),
            ScanResult::Direct(_) => None,
        }
    }

    pub fn movie_count(&self) -> usize {
        match self {
            ScanResult::Direct(direct) => direct.movie_count(),
            ScanResult::Catalog(catalog) => catalog.movies.len(),
        }
    }

    pub fn series_count(&self) -> usize {
        match self {
            ScanResult::Direct(direct) => direct.series_count(),
            ScanResult::Catalog(catalog) => catalog.series.len(),
        }
    }
}

/// What a direct filesystem walk found, keyed by configured library root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectResult {
    pub movies: BTreeMap<PathBuf, Vec<PathBuf>>,
    pub series: BTreeMap<PathBuf, Vec<PathBuf>>,
}

impl DirectResult {
    pub fn movie_count(&self) -> usize {
        self.movies.values().map(Vec::len).sum()
    }

    pub fn series_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

/// Candidates reported by the media server as missing the target subtitle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogResult {
    pub movies: Vec<CatalogMovie>,
    /// Series root directory -> episodes of that series needing subtitles.
    pub series: BTreeMap<PathBuf, Vec<CatalogEpisode>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMovie {
    pub physical_path: PathBuf,
    pub item_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEpisode {
    pub physical_path: PathBuf,
    pub series_root_dir: PathBuf,
    pub item_id: String,
}
