//! One scan cycle: read one-shot flags, scan, refresh the identity cache,
//! then filter candidates into the job queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::settings::{RunSettings, Settings};
use crate::error::{ExecutorError, QueueError, RunError, ScanError, TaskError};
use crate::models::identity::IdentityCacheEntry;
use crate::models::job::{Job, VideoKind};
use crate::models::scan_result::{CatalogResult, DirectResult, ScanMode, ScanResult};

use super::cache::IdentityStore;
use super::catalog::{CatalogScanner, MediaServerClient};
use super::episode::parse_episode_path;
use super::evaluator::SubtitleNeedEvaluator;
use super::events::{EventSender, RunEvent};
use super::executor::{BoundedExecutor, TaskContext, TaskUnit};
use super::markers::{ClaimedFlags, FlagStore};
use super::progress::RunProgress;
use super::queue::JobQueue;
use super::resolver::MetadataResolver;
use super::restore::restore_timeline_backups;
use super::scanner::FilesystemScanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    Idle,
    FlagsRead,
    Scanned,
    CacheRefreshed,
    Filtered,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: ScanMode,
    pub forced: bool,
    pub restored_backups: usize,
    pub movies_found: usize,
    pub series_found: usize,
    pub cache_updates: usize,
    pub jobs_queued: usize,
    pub duplicates: usize,
    pub item_failures: usize,
    pub elapsed: Duration,
}

/// External services the orchestrator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub identity_store: Arc<dyn IdentityStore>,
    pub resolver: Arc<dyn MetadataResolver>,
    pub evaluator: Arc<dyn SubtitleNeedEvaluator>,
    pub media_server: Option<Arc<dyn MediaServerClient>>,
}

/// Shared handles cloned into every process function.
#[derive(Clone)]
struct StageDeps {
    queue: Arc<JobQueue>,
    progress: Arc<RunProgress>,
    events: Option<EventSender>,
}

impl StageDeps {
    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Add a job, treating an already-queued one as a normal outcome.
    fn enqueue(&self, job: Job) -> Result<bool, QueueError> {
        let kind = job.kind;
        let path = job.physical_path.clone();
        match self.queue.add(job) {
            Ok(true) => {
                self.progress.increment_jobs();
                self.emit(RunEvent::JobQueued { kind, path });
                Ok(true)
            }
            Ok(false) => {
                warn!(%kind, path = %path.display(), "Job already queued");
                self.progress.increment_duplicates();
                self.emit(RunEvent::DuplicateJob { kind, path });
                Ok(false)
            }
            Err(e) => {
                error!(%kind, path = %path.display(), error = %e, "Could not queue job");
                Err(e)
            }
        }
    }
}

pub struct ScanOrchestrator {
    settings: Arc<Settings>,
    flags: FlagStore,
    executor: BoundedExecutor<PathBuf>,
    scanner: FilesystemScanner,
    catalog: CatalogScanner,
    identity_store: Arc<dyn IdentityStore>,
    resolver: Arc<dyn MetadataResolver>,
    evaluator: Arc<dyn SubtitleNeedEvaluator>,
    deps: StageDeps,
    state: Mutex<RunState>,
    run_cancel: Mutex<CancellationToken>,
    run_lock: tokio::sync::Mutex<()>,
    last_result: Mutex<Option<Arc<ScanResult>>>,
}

impl ScanOrchestrator {
    pub fn new(
        settings: Settings,
        flags: FlagStore,
        queue: Arc<JobQueue>,
        collaborators: Collaborators,
    ) -> Result<Self, ExecutorError> {
        let executor = BoundedExecutor::new(settings.executor.concurrency)?;
        let progress = Arc::new(RunProgress::new());
        Ok(Self {
            scanner: FilesystemScanner::new(&settings, Arc::clone(&progress)),
            catalog: CatalogScanner::new(collaborators.media_server),
            settings: Arc::new(settings),
            flags,
            executor,
            identity_store: collaborators.identity_store,
            resolver: collaborators.resolver,
            evaluator: collaborators.evaluator,
            deps: StageDeps {
                queue,
                progress,
                events: None,
            },
            state: Mutex::new(RunState::Idle),
            run_cancel: Mutex::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
            last_result: Mutex::new(None),
        })
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.deps.events = Some(events);
        self
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.deps.queue
    }

    pub fn progress(&self) -> &Arc<RunProgress> {
        &self.deps.progress
    }

    /// Scan result of the most recent run that got past the scan stage.
    pub fn last_scan_result(&self) -> Option<Arc<ScanResult>> {
        self.last_result.lock().clone()
    }

    /// Abort the current run. Jobs already queued stay queued.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if *state == RunState::Idle {
                return;
            }
            info!(state = ?*state, "Cancelling scan run");
            // Under the state lock so `enter` cannot slip a stage in between.
            self.run_cancel.lock().cancel();
            *state = RunState::Idle;
        }
        self.executor.release();
        self.executor.reboot();
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock() = state;
    }

    fn enter(&self, state: RunState, cancel: &CancellationToken) -> Result<(), RunError> {
        {
            let mut current = self.state.lock();
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled { stage: state });
            }
            *current = state;
        }
        debug!(?state, "Entering run stage");
        self.deps.emit(RunEvent::StageEntered { state });
        Ok(())
    }

    /// Run one full scan cycle.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let _running = self.run_lock.try_lock().map_err(|_| RunError::AlreadyRunning)?;
        let cancel = CancellationToken::new();
        *self.run_cancel.lock() = cancel.clone();
        self.deps.progress.reset();

        info!("------------------------------------");
        info!("Video scan started");

        let claimed = match self.read_flags(&cancel) {
            Ok(claimed) => claimed,
            Err(e) => return Err(self.abort(e, ClaimedFlags::default())),
        };

        let outcome = self.run_stages(claimed, &cancel).await;
        self.set_state(RunState::Idle);

        let result = match outcome {
            Ok(summary) => {
                if let Err(e) = self.flags.complete(claimed) {
                    error!(error = %e, "Could not clear consumed one-shot flags");
                }
                info!(
                    jobs = summary.jobs_queued,
                    duplicates = summary.duplicates,
                    failures = summary.item_failures,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Video scan finished"
                );
                self.deps.emit(RunEvent::RunCompleted {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Err(e) => Err(self.abort(e, claimed)),
        };
        info!("------------------------------------");
        result
    }

    fn abort(&self, err: RunError, claimed: ClaimedFlags) -> RunError {
        self.set_state(RunState::Idle);
        if let Err(e) = self.flags.reset(claimed) {
            error!(error = %e, "Could not re-arm one-shot flags");
        }
        error!(stage = ?err.stage(), error = %err, "Video scan aborted");
        self.deps.emit(RunEvent::RunAborted {
            stage: err.stage(),
            error: err.to_string(),
        });
        err
    }

    fn read_flags(&self, cancel: &CancellationToken) -> Result<ClaimedFlags, RunError> {
        self.enter(RunState::FlagsRead, cancel)?;
        self.flags.ingest_marker_files()?;
        let claimed = self.flags.claim()?;
        info!(
            forced = claimed.forced_full_rescan,
            restore_backups = claimed.restore_timeline_backup,
            "One-shot flags read"
        );
        self.deps.emit(RunEvent::RunStarted {
            forced: claimed.forced_full_rescan,
            restore_backups: claimed.restore_timeline_backup,
        });
        Ok(claimed)
    }

    async fn run_stages(
        &self,
        claimed: ClaimedFlags,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let run = RunSettings::new(Arc::clone(&self.settings), claimed.forced_full_rescan);
        if run.forced() {
            info!("Forced scan: existing subtitles and the download window are ignored");
        }

        let mut restored_backups = 0;
        if claimed.restore_timeline_backup {
            let roots = self
                .settings
                .movie_paths
                .iter()
                .chain(&self.settings.series_paths)
                .cloned()
                .collect();
            restored_backups = restore_timeline_backups(roots).await?;
        }

        self.enter(RunState::Scanned, cancel)?;
        let result = Arc::new(self.scan(&run, cancel).await?);
        *self.last_result.lock() = Some(Arc::clone(&result));

        self.enter(RunState::CacheRefreshed, cancel)?;
        if let ScanResult::Direct(direct) = result.as_ref() {
            self.refresh_identity_cache(direct, cancel).await?;
        }

        self.enter(RunState::Filtered, cancel)?;
        match result.as_ref() {
            ScanResult::Direct(direct) => self.filter_direct(direct, &run, cancel).await?,
            ScanResult::Catalog(catalog) => self.filter_catalog(catalog, &run, cancel).await?,
        }
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled {
                stage: RunState::Filtered,
            });
        }

        let snapshot = self.deps.progress.snapshot();
        Ok(RunSummary {
            mode: result.mode(),
            forced: run.forced(),
            restored_backups,
            movies_found: result.movie_count(),
            series_found: result.series_count(),
            cache_updates: snapshot.cache_updates,
            jobs_queued: snapshot.jobs_queued,
            duplicates: snapshot.duplicates,
            item_failures: snapshot.item_failures,
            elapsed: snapshot.elapsed,
        })
    }

    async fn scan(
        &self,
        run: &RunSettings,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, RunError> {
        // Mode is fixed once per run; the two sources are never merged.
        if run.base().catalog_mode() {
            info!("Scanning through the media server catalog");
            let catalog = tokio::select! {
                res = self.catalog.scan(run) => res?,
                _ = cancel.cancelled() => return Err(RunError::Cancelled { stage: RunState::Scanned }),
            };
            self.deps.progress.add_movies(catalog.movies.len());
            self.deps.progress.add_series(catalog.series.len());
            Ok(ScanResult::Catalog(catalog))
        } else {
            let direct = self
                .scanner
                .scan(&run.base().movie_paths, &run.base().series_paths, cancel)
                .await
                .map_err(|e| match e {
                    ScanError::Cancelled => RunError::Cancelled {
                        stage: RunState::Scanned,
                    },
                    e => RunError::Scan(e),
                })?;
            Ok(ScanResult::Direct(direct))
        }
    }

    /// Submit every path as a unit of the current batch, then wait for the batch.
    async fn run_batch<'a>(
        &self,
        stage: RunState,
        groups: impl Iterator<Item = &'a Vec<PathBuf>>,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let mut submit_err = None;
        'groups: for paths in groups {
            for (i, path) in paths.iter().enumerate() {
                if cancel.is_cancelled() {
                    break 'groups;
                }
                if let Err(source) = self
                    .executor
                    .invoke(TaskUnit::new(i, paths.len(), path.clone()))
                    .await
                {
                    submit_err = Some(source);
                    break 'groups;
                }
            }
        }

        let report = self.executor.hold().await;
        self.deps.progress.add_failures(report.unsuccessful());
        debug!(?stage, ?report, "Batch finished");

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled { stage });
        }
        match submit_err {
            Some(source) => Err(RunError::Executor { stage, source }),
            None => Ok(()),
        }
    }

    async fn refresh_identity_cache(
        &self,
        direct: &DirectResult,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let timeout = self.settings.task_timeout();
        info!(
            movies = direct.movie_count(),
            series = direct.series_count(),
            "Refreshing identity cache"
        );

        let mut outcome = Ok(());
        for kind in [VideoKind::Movie, VideoKind::Series] {
            let store = Arc::clone(&self.identity_store);
            let resolver = Arc::clone(&self.resolver);
            let deps = self.deps.clone();
            self.executor.set_process_func(
                "refresh_identity_cache",
                move |_ctx, unit: TaskUnit<PathBuf>| {
                    refresh_identity(Arc::clone(&store), Arc::clone(&resolver), deps.clone(), kind, unit)
                },
                timeout,
            );
            let groups = match kind {
                VideoKind::Movie => direct.movies.values(),
                VideoKind::Series => direct.series.values(),
            };
            outcome = self.run_batch(RunState::CacheRefreshed, groups, cancel).await;
            if outcome.is_err() {
                break;
            }
        }

        // Entries upserted before a failure or cancel are still kept.
        if let Err(e) = self.identity_store.flush().await {
            error!(error = %e, "Could not persist the identity cache");
            outcome = outcome.and(Err(RunError::Cache(e)));
        }
        outcome
    }

    async fn filter_direct(
        &self,
        direct: &DirectResult,
        run: &RunSettings,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let timeout = self.settings.task_timeout();
        let forced = run.forced();
        let priority = self.settings.subtitle.priority;

        let evaluator = Arc::clone(&self.evaluator);
        let deps = self.deps.clone();
        self.executor.set_process_func(
            "filter_movies",
            move |_ctx, unit: TaskUnit<PathBuf>| {
                filter_movie(Arc::clone(&evaluator), deps.clone(), forced, priority, unit)
            },
            timeout,
        );
        self.run_batch(RunState::Filtered, direct.movies.values(), cancel)
            .await?;

        let evaluator = Arc::clone(&self.evaluator);
        let deps = self.deps.clone();
        self.executor.set_process_func(
            "filter_series",
            move |ctx, unit: TaskUnit<PathBuf>| {
                filter_series(Arc::clone(&evaluator), deps.clone(), ctx, forced, priority, unit)
            },
            timeout,
        );
        self.run_batch(RunState::Filtered, direct.series.values(), cancel)
            .await
    }

    async fn filter_catalog(
        &self,
        catalog: &CatalogResult,
        run: &RunSettings,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let forced = run.forced();
        let priority = self.settings.subtitle.priority;

        for movie in &catalog.movies {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !self
                .evaluator
                .movie_needs_download(&movie.physical_path, forced)
                .await
            {
                continue;
            }
            let job = Job::movie(movie.physical_path.clone(), priority)
                .with_external_id(movie.item_id.clone());
            if self.deps.enqueue(job).is_err() {
                self.deps.progress.add_failures(1);
            }
        }

        // The media server already filtered these episodes down to the ones
        // missing subtitles.
        for episodes in catalog.series.values() {
            for ep in episodes {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let Some(parsed) = parse_episode_path(&ep.physical_path) else {
                    warn!(path = %ep.physical_path.display(), "No season/episode in catalog file name, skipping");
                    self.deps.progress.add_failures(1);
                    continue;
                };
                let job = Job::episode(
                    ep.physical_path.clone(),
                    priority,
                    parsed.season,
                    parsed.episode,
                    ep.series_root_dir.clone(),
                )
                .with_external_id(ep.item_id.clone());
                if self.deps.enqueue(job).is_err() {
                    self.deps.progress.add_failures(1);
                }
            }
        }
        Ok(())
    }
}

async fn refresh_identity(
    store: Arc<dyn IdentityStore>,
    resolver: Arc<dyn MetadataResolver>,
    deps: StageDeps,
    kind: VideoKind,
    unit: TaskUnit<PathBuf>,
) -> Result<(), TaskError> {
    let path = unit.payload;
    debug!(index = unit.index, total = unit.total, path = %path.display(), "Resolving identity");

    let resolved = match resolver.resolve_identity(&path, kind).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Identity not resolved, skipping");
            return Err(e.into());
        }
    };

    let (root_dir, is_movie) = match kind {
        VideoKind::Movie => (path.parent().map(PathBuf::from).unwrap_or_default(), true),
        VideoKind::Series => (path.clone(), false),
    };
    if resolved.is_movie != is_movie {
        debug!(path = %path.display(), external_id = %resolved.external_id, "Metadata disagrees with library type, keeping library type");
    }
    if root_dir.as_os_str().is_empty() {
        return Ok(());
    }

    let stored = store.get_by_external_id(&resolved.external_id).await?;
    let unchanged = stored
        .as_ref()
        .is_some_and(|e| e.root_dir == root_dir && e.is_movie == is_movie);
    if unchanged {
        return Ok(());
    }

    store
        .upsert(IdentityCacheEntry {
            root_dir,
            external_id: resolved.external_id,
            is_movie,
        })
        .await?;
    deps.progress.increment_cache_updates();
    Ok(())
}

async fn filter_movie(
    evaluator: Arc<dyn SubtitleNeedEvaluator>,
    deps: StageDeps,
    forced: bool,
    priority: i32,
    unit: TaskUnit<PathBuf>,
) -> Result<(), TaskError> {
    let path = unit.payload;
    if !evaluator.movie_needs_download(&path, forced).await {
        return Ok(());
    }
    deps.enqueue(Job::movie(path, priority))?;
    Ok(())
}

async fn filter_series(
    evaluator: Arc<dyn SubtitleNeedEvaluator>,
    deps: StageDeps,
    ctx: TaskContext,
    forced: bool,
    priority: i32,
    unit: TaskUnit<PathBuf>,
) -> Result<(), TaskError> {
    let dir = unit.payload;
    let need = match evaluator.series_needs_download(&dir, forced, false).await {
        Ok(need) => need,
        Err(e) => {
            error!(series = %dir.display(), error = %e, "Series evaluation failed");
            deps.emit(RunEvent::ItemFailed {
                path: dir,
                error: e.to_string(),
            });
            return Err(e.into());
        }
    };
    if !need.needed {
        return Ok(());
    }

    for ep in need.info.need_download {
        if ctx.is_cancelled() {
            break;
        }
        let job = Job::episode(
            ep.file_path,
            priority,
            ep.season,
            ep.episode,
            need.info.dir_path.clone(),
        );
        // One bad episode does not drop the rest of the series.
        if deps.enqueue(job).is_err() {
            deps.progress.add_failures(1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryIdentityStore;
    use crate::core::evaluator::LocalSubtitleEvaluator;
    use crate::core::resolver::NfoMetadataResolver;

    #[test]
    fn test_stage_after_cancel_stays_idle() {
        let dir = std::env::temp_dir().join("subsweep_unit_stage_after_cancel");
        let _ = std::fs::remove_dir_all(&dir);
        let settings = Settings {
            data_dir: dir.clone(),
            ..Settings::default()
        };
        let collaborators = Collaborators {
            identity_store: Arc::new(MemoryIdentityStore::new()),
            resolver: Arc::new(NfoMetadataResolver::new()),
            evaluator: Arc::new(LocalSubtitleEvaluator::new(&settings)),
            media_server: None,
        };
        let flags = FlagStore::open(dir.clone()).unwrap();
        let orchestrator =
            ScanOrchestrator::new(settings, flags, Arc::new(JobQueue::new()), collaborators).unwrap();

        let token = orchestrator.run_cancel.lock().clone();
        orchestrator.enter(RunState::Scanned, &token).unwrap();
        assert_eq!(orchestrator.state(), RunState::Scanned);

        orchestrator.cancel();
        assert_eq!(orchestrator.state(), RunState::Idle);
        assert!(matches!(
            orchestrator.enter(RunState::CacheRefreshed, &token),
            Err(RunError::Cancelled {
                stage: RunState::CacheRefreshed
            })
        ));
        assert_eq!(orchestrator.state(), RunState::Idle);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
