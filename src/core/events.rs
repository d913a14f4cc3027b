use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::models::job::VideoKind;

use super::orchestrator::{RunState, RunSummary};

#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { forced: bool, restore_backups: bool },
    StageEntered { state: RunState },

    // Per-item outcomes
    JobQueued { kind: VideoKind, path: PathBuf },
    DuplicateJob { kind: VideoKind, path: PathBuf },
    ItemFailed { path: PathBuf, error: String },

    RunCompleted { summary: RunSummary },
    RunAborted { stage: RunState, error: String },
}

pub type EventSender = mpsc::UnboundedSender<RunEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
