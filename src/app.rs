use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::settings::Settings;
use crate::core::cache::FileIdentityStore;
use crate::core::evaluator::LocalSubtitleEvaluator;
use crate::core::events::{self, EventReceiver, RunEvent};
use crate::core::markers::{FlagStore, OneShotFlag};
use crate::core::orchestrator::{Collaborators, RunSummary, ScanOrchestrator};
use crate::core::queue::JobQueue;
use crate::core::resolver::NfoMetadataResolver;
use crate::error::RunError;
use crate::export;

/// What the command line asked for beyond the settings file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub forced: bool,
    pub restore_backups: bool,
    pub interval: Option<Duration>,
    pub export_json: Option<PathBuf>,
}

pub struct App {
    orchestrator: Arc<ScanOrchestrator>,
    options: RunOptions,
}

impl App {
    pub async fn new(settings: Settings, options: RunOptions) -> anyhow::Result<Self> {
        let identity_store = FileIdentityStore::open(settings.data_dir.join("identity")).await?;
        let flags = FlagStore::open(settings.data_dir.clone())?;
        if options.forced {
            flags.arm(OneShotFlag::ForcedFullRescan)?;
        }
        if options.restore_backups {
            flags.arm(OneShotFlag::RestoreTimelineBackup)?;
        }

        let collaborators = Collaborators {
            identity_store: Arc::new(identity_store),
            resolver: Arc::new(NfoMetadataResolver::new()),
            evaluator: Arc::new(LocalSubtitleEvaluator::new(&settings)),
            // The binary ships no media-server client.
            media_server: None,
        };

        let (event_tx, event_rx) = events::create_event_channel();
        let orchestrator = ScanOrchestrator::new(settings, flags, Arc::new(JobQueue::new()), collaborators)?
            .with_events(event_tx);
        tokio::spawn(print_events(event_rx));

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            options,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let stop = self.run_once().await?;
            let Some(interval) = self.options.interval else {
                break;
            };
            if stop {
                break;
            }
            info!(secs = interval.as_secs(), "Waiting for the next scan");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, exiting");
                    break;
                }
            }
        }
        Ok(())
    }

    /// One scan cycle. Returns `true` when Ctrl-C cancelled it.
    async fn run_once(&self) -> anyhow::Result<bool> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let run = orchestrator.run();
        tokio::pin!(run);

        let (outcome, interrupted) = tokio::select! {
            outcome = &mut run => (outcome, false),
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling the current scan");
                self.orchestrator.cancel();
                (run.await, true)
            }
        };

        match outcome {
            Ok(summary) => println!("{}", summary_line(&summary)),
            Err(RunError::Cancelled { stage }) => {
                println!("Scan cancelled at {stage:?}");
            }
            // Another cycle failing does not stop a periodic run.
            Err(e) if self.options.interval.is_some() => {
                eprintln!("Scan failed: {e}");
            }
            Err(e) => return Err(e.into()),
        }

        self.report_queue()?;
        Ok(interrupted)
    }

    fn report_queue(&self) -> anyhow::Result<()> {
        let jobs = self.orchestrator.queue().snapshot();
        for job in &jobs {
            match (job.season, job.episode) {
                (Some(s), Some(e)) => println!("[{}] {} S{s:02}E{e:02} {}", job.priority, job.kind, job.physical_path.display()),
                _ => println!("[{}] {} {}", job.priority, job.kind, job.physical_path.display()),
            }
        }
        if let Some(ref export_path) = self.options.export_json {
            export::json::export_jobs(&jobs, export_path)?;
            println!("Exported to: {}", export_path.display());
        }
        Ok(())
    }
}

fn summary_line(summary: &RunSummary) -> String {
    format!(
        "Scan finished: {} movie file(s), {} series folder(s), {} job(s) queued, {} duplicate(s), {} failure(s) in {:.2?}",
        summary.movies_found,
        summary.series_found,
        summary.jobs_queued,
        summary.duplicates,
        summary.item_failures,
        summary.elapsed
    )
}

async fn print_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::StageEntered { state } => eprintln!("-> {state:?}"),
            RunEvent::ItemFailed { path, error } => eprintln!("failed: {} ({error})", path.display()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scan_result::ScanMode;

    #[test]
    fn test_summary_line_counts_files_and_folders() {
        let summary = RunSummary {
            mode: ScanMode::Filesystem,
            forced: false,
            restored_backups: 0,
            movies_found: 12,
            series_found: 3,
            cache_updates: 0,
            jobs_queued: 4,
            duplicates: 1,
            item_failures: 0,
            elapsed: Duration::from_millis(1500),
        };
        let line = summary_line(&summary);
        assert!(line.contains("12 movie file(s)"));
        assert!(line.contains("3 series folder(s)"));
        assert!(!line.contains("root"));
    }
}
