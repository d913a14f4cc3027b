use std::path::PathBuf;

use thiserror::Error;

use crate::core::orchestrator::RunState;

/// Boxed error returned by a process function registered on the executor.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("worker pool needs at least one slot")]
    InvalidConcurrency,
    #[error("no process function registered")]
    NoProcessFunc,
    #[error("worker pool has been released, reboot it before reuse")]
    Released,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job has an empty physical path")]
    EmptyPath,
    #[error("series job {0} needs both season and episode")]
    MissingEpisode(PathBuf),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("scan cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum MediaServerError {
    #[error("media server integration is enabled but no client is installed")]
    NotConfigured,
    #[error("media server request failed: {0}")]
    Request(String),
    #[error("media server returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("identity cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity cache encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("identity cache meta error: {0}")]
    Meta(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no identity could be resolved for {0}")]
    Unresolvable(PathBuf),
    #[error("failed to read metadata for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("failed to read series directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("evaluation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("flag record io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("flag record is corrupt: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("restore task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Top-level failure of one orchestrated run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("run cancelled during {stage:?}")]
    Cancelled { stage: RunState },
    #[error("reading one-shot flags failed: {0}")]
    Flags(#[from] MarkerError),
    #[error("restoring timeline backups failed: {0}")]
    Restore(#[from] RestoreError),
    #[error("filesystem scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("catalog scan failed: {0}")]
    Catalog(#[from] MediaServerError),
    #[error("persisting the identity cache failed: {0}")]
    Cache(#[from] CacheError),
    #[error("worker pool failed during {stage:?}: {source}")]
    Executor {
        stage: RunState,
        #[source]
        source: ExecutorError,
    },
}

impl RunError {
    /// The stage the run was in when it failed.
    pub fn stage(&self) -> RunState {
        match self {
            RunError::AlreadyRunning => RunState::Idle,
            RunError::Cancelled { stage } => *stage,
            RunError::Flags(_) => RunState::FlagsRead,
            RunError::Restore(_) => RunState::FlagsRead,
            RunError::Scan(_) | RunError::Catalog(_) => RunState::Scanned,
            RunError::Cache(_) => RunState::CacheRefreshed,
            RunError::Executor { stage, .. } => *stage,
        }
    }
}
