//! One-shot operational flags.
//!
//! Each flag moves `Inert -> Armed -> Claimed -> Inert`. An external trigger
//! arms it, a run claims it when it starts, and only a run that completes
//! returns it to `Inert`. A run that aborts puts a claimed flag back to
//! `Armed` so the next run picks it up again.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MarkerError;

const RECORD_FILE: &str = "flags.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneShotFlag {
    ForcedFullRescan,
    RestoreTimelineBackup,
}

impl OneShotFlag {
    pub const ALL: [OneShotFlag; 2] = [OneShotFlag::ForcedFullRescan, OneShotFlag::RestoreTimelineBackup];

    /// Marker file an external trigger may drop into the data directory.
    pub fn marker_file_name(self) -> &'static str {
        match self {
            OneShotFlag::ForcedFullRescan => "forced_scan_and_down_sub",
            OneShotFlag::RestoreTimelineBackup => "restore_fix_timeline_bk",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagState {
    #[default]
    Inert,
    Armed,
    Claimed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagRecord {
    pub forced_full_rescan: FlagState,
    pub restore_timeline_backup: FlagState,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FlagRecord {
    pub fn state(&self, flag: OneShotFlag) -> FlagState {
        match flag {
            OneShotFlag::ForcedFullRescan => self.forced_full_rescan,
            OneShotFlag::RestoreTimelineBackup => self.restore_timeline_backup,
        }
    }

    fn state_mut(&mut self, flag: OneShotFlag) -> &mut FlagState {
        match flag {
            OneShotFlag::ForcedFullRescan => &mut self.forced_full_rescan,
            OneShotFlag::RestoreTimelineBackup => &mut self.restore_timeline_backup,
        }
    }
}

/// Flags claimed by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimedFlags {
    pub forced_full_rescan: bool,
    pub restore_timeline_backup: bool,
}

impl ClaimedFlags {
    pub fn any(&self) -> bool {
        self.forced_full_rescan || self.restore_timeline_backup
    }

    fn contains(&self, flag: OneShotFlag) -> bool {
        match flag {
            OneShotFlag::ForcedFullRescan => self.forced_full_rescan,
            OneShotFlag::RestoreTimelineBackup => self.restore_timeline_backup,
        }
    }
}

/// Persistent flag record in the data directory.
pub struct FlagStore {
    dir: PathBuf,
    record: Mutex<FlagRecord>,
}

impl FlagStore {
    /// Load the record. A record left `Claimed` by an interrupted run is
    /// treated as `Armed`.
    pub fn open(dir: PathBuf) -> Result<Self, MarkerError> {
        std::fs::create_dir_all(&dir).map_err(|source| MarkerError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(RECORD_FILE);
        let mut record = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<FlagRecord>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FlagRecord::default(),
            Err(source) => return Err(MarkerError::Io { path, source }),
        };
        for flag in OneShotFlag::ALL {
            let state = record.state_mut(flag);
            if *state == FlagState::Claimed {
                warn!(?flag, "Flag was claimed by an interrupted run, re-arming");
                *state = FlagState::Armed;
            }
        }
        Ok(Self {
            dir,
            record: Mutex::new(record),
        })
    }

    pub fn record(&self) -> FlagRecord {
        self.record.lock().clone()
    }

    /// Arm a flag for the next run.
    pub fn arm(&self, flag: OneShotFlag) -> Result<(), MarkerError> {
        let mut record = self.record.lock();
        *record.state_mut(flag) = FlagState::Armed;
        self.persist(&mut record)?;
        info!(?flag, "One-shot flag armed");
        Ok(())
    }

    /// Turn marker files left by external triggers into armed flags, removing the files.
    pub fn ingest_marker_files(&self) -> Result<usize, MarkerError> {
        let mut record = self.record.lock();
        let mut armed = 0;
        for flag in OneShotFlag::ALL {
            let marker = self.dir.join(flag.marker_file_name());
            if !marker.exists() {
                continue;
            }
            *record.state_mut(flag) = FlagState::Armed;
            armed += 1;
            self.persist(&mut record)?;
            std::fs::remove_file(&marker).map_err(|source| MarkerError::Io {
                path: marker.clone(),
                source,
            })?;
            info!(?flag, marker = %marker.display(), "Marker file ingested");
        }
        Ok(armed)
    }

    /// Atomically move every armed flag to `Claimed` and report which were claimed.
    pub fn claim(&self) -> Result<ClaimedFlags, MarkerError> {
        let mut record = self.record.lock();
        let mut claimed = ClaimedFlags::default();
        for flag in OneShotFlag::ALL {
            let state = record.state_mut(flag);
            if *state == FlagState::Armed {
                *state = FlagState::Claimed;
                match flag {
                    OneShotFlag::ForcedFullRescan => claimed.forced_full_rescan = true,
                    OneShotFlag::RestoreTimelineBackup => claimed.restore_timeline_backup = true,
                }
            }
        }
        if claimed.any() {
            self.persist(&mut record)?;
        }
        Ok(claimed)
    }

    /// The run that claimed `flags` completed: consume them.
    pub fn complete(&self, flags: ClaimedFlags) -> Result<(), MarkerError> {
        self.transition(flags, FlagState::Inert)
    }

    /// The run that claimed `flags` aborted: re-arm them.
    pub fn reset(&self, flags: ClaimedFlags) -> Result<(), MarkerError> {
        self.transition(flags, FlagState::Armed)
    }

    fn transition(&self, flags: ClaimedFlags, to: FlagState) -> Result<(), MarkerError> {
        if !flags.any() {
            return Ok(());
        }
        let mut record = self.record.lock();
        for flag in OneShotFlag::ALL {
            let state = record.state_mut(flag);
            // A trigger that re-armed the flag mid-run wins over the run.
            if flags.contains(flag) && *state == FlagState::Claimed {
                *state = to;
            }
        }
        self.persist(&mut record)
    }

    fn persist(&self, record: &mut FlagRecord) -> Result<(), MarkerError> {
        record.updated_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&*record)?;
        write_atomic(&self.dir.join(RECORD_FILE), &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MarkerError> {
    let io_err = |source| MarkerError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
