use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use subsweep::config::settings::Settings;
use subsweep::core::cache::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
use subsweep::core::catalog::{CatalogQuery, MediaServerClient};
use subsweep::core::evaluator::{LocalSubtitleEvaluator, SubtitleNeedEvaluator};
use subsweep::core::events::{create_event_channel, RunEvent};
use subsweep::core::markers::{FlagState, FlagStore, OneShotFlag};
use subsweep::core::orchestrator::{Collaborators, RunState, ScanOrchestrator};
use subsweep::core::queue::JobQueue;
use subsweep::core::resolver::NfoMetadataResolver;
use subsweep::error::{EvaluateError, MediaServerError, RunError};
use subsweep::models::job::VideoKind;
use subsweep::models::scan_result::{CatalogEpisode, CatalogMovie, CatalogResult, ScanMode};
use subsweep::models::series::{EpisodeInfo, SeriesInfo, SeriesNeed};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Create a unique temporary directory for a test.
fn make_test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("subsweep_orch_test_{}", name));
    let _ = std::fs::remove_dir_all(&dir); // clean up from previous runs
    std::fs::create_dir_all(&dir).expect("create test dir");
    dir
}

/// Remove a temporary test directory.
fn cleanup(dir: &PathBuf) {
    let _ = std::fs::remove_dir_all(dir);
}

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, b"x").expect("write file");
}

fn library_settings(dir: &Path, movie_roots: &[&str], series_roots: &[&str]) -> Settings {
    let mut settings = Settings {
        movie_paths: movie_roots.iter().map(|r| dir.join(r)).collect(),
        series_paths: series_roots.iter().map(|r| dir.join(r)).collect(),
        data_dir: dir.join("data"),
        ..Settings::default()
    };
    settings.executor.concurrency = 2;
    settings
}

fn build(
    settings: Settings,
    store: Arc<dyn IdentityStore>,
    evaluator: Arc<dyn SubtitleNeedEvaluator>,
    media_server: Option<Arc<dyn MediaServerClient>>,
) -> ScanOrchestrator {
    let flags = FlagStore::open(settings.data_dir.clone()).expect("open flag store");
    let collaborators = Collaborators {
        identity_store: store,
        resolver: Arc::new(NfoMetadataResolver::new()),
        evaluator,
        media_server,
    };
    ScanOrchestrator::new(settings, flags, Arc::new(JobQueue::new()), collaborators)
        .expect("build orchestrator")
}

fn local(settings: &Settings) -> Arc<dyn SubtitleNeedEvaluator> {
    Arc::new(LocalSubtitleEvaluator::new(settings))
}

struct FakeMediaServer {
    result: CatalogResult,
    refreshes: AtomicUsize,
    limits: parking_lot::Mutex<Vec<u32>>,
}

#[async_trait]
impl MediaServerClient for FakeMediaServer {
    async fn refresh_subtitle_listing(&self) -> Result<bool, MediaServerError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn recently_added_missing_subtitle(
        &self,
        query: &CatalogQuery,
    ) -> Result<CatalogResult, MediaServerError> {
        self.limits.lock().push(query.limit);
        Ok(self.result.clone())
    }
}

/// Evaluator whose movie check never finishes on its own.
struct StuckEvaluator;

#[async_trait]
impl SubtitleNeedEvaluator for StuckEvaluator {
    async fn movie_needs_download(&self, _path: &Path, _forced: bool) -> bool {
        tokio::time::sleep(Duration::from_secs(60)).await;
        true
    }

    async fn series_needs_download(
        &self,
        _series_dir: &Path,
        _forced: bool,
        _quick_check_only: bool,
    ) -> Result<SeriesNeed, EvaluateError> {
        Ok(SeriesNeed::default())
    }
}

/// Evaluator that reports a fixed need list for every series.
struct FixedSeriesEvaluator {
    episodes: Vec<EpisodeInfo>,
}

#[async_trait]
impl SubtitleNeedEvaluator for FixedSeriesEvaluator {
    async fn movie_needs_download(&self, _path: &Path, _forced: bool) -> bool {
        false
    }

    async fn series_needs_download(
        &self,
        series_dir: &Path,
        _forced: bool,
        _quick_check_only: bool,
    ) -> Result<SeriesNeed, EvaluateError> {
        Ok(SeriesNeed {
            needed: true,
            info: SeriesInfo {
                name: "Show".into(),
                dir_path: series_dir.to_path_buf(),
                episodes: self.episodes.clone(),
                need_download: self.episodes.clone(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// 1. test_two_movie_roots_queue_two_jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_movie_roots_queue_two_jobs() {
    let dir = make_test_dir("two_roots");
    touch(&dir.join("movies-a/Alpha/Alpha.mkv"));
    touch(&dir.join("movies-b/Beta/Beta.mp4"));

    let settings = library_settings(&dir, &["movies-a", "movies-b"], &[]);
    let evaluator = local(&settings);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);

    let summary = orchestrator.run().await.expect("run should succeed");

    assert_eq!(summary.mode, ScanMode::Filesystem);
    assert_eq!(summary.jobs_queued, 2);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(orchestrator.queue().len(), 2);
    assert_eq!(orchestrator.state(), RunState::Idle);
    let jobs = orchestrator.queue().snapshot();
    assert!(jobs.iter().all(|j| j.kind == VideoKind::Movie));

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 2. test_series_episodes_and_duplicates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_series_episodes_and_duplicates() {
    let dir = make_test_dir("series_dupes");
    let show = dir.join("series/Show");
    touch(&show.join("Show.S01E01.mkv"));
    touch(&show.join("Show.S01E01.chs.srt"));
    touch(&show.join("Show.S01E02.mkv"));
    touch(&show.join("Show.S01E03.mkv"));

    let settings = library_settings(&dir, &[], &["series"]);
    let evaluator = local(&settings);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);

    let first = orchestrator.run().await.expect("first run");
    assert_eq!(first.jobs_queued, 2);
    let jobs = orchestrator.queue().snapshot();
    let episodes: Vec<(Option<u32>, Option<u32>)> =
        jobs.iter().map(|j| (j.season, j.episode)).collect();
    assert_eq!(episodes, vec![(Some(1), Some(2)), (Some(1), Some(3))]);
    assert!(jobs.iter().all(|j| j.series_root_dir.as_deref() == Some(show.as_path())));

    // Nothing was consumed, so a second run only finds duplicates.
    let second = orchestrator.run().await.expect("second run");
    assert_eq!(second.jobs_queued, 0);
    assert_eq!(second.duplicates, 2);
    assert_eq!(orchestrator.queue().len(), 2);

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 3. test_forced_flag_is_consumed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_forced_flag_is_consumed() {
    let dir = make_test_dir("forced");
    touch(&dir.join("movies/Alpha/Alpha.mkv"));
    touch(&dir.join("movies/Alpha/Alpha.zh.srt"));

    let settings = library_settings(&dir, &["movies"], &[]);
    let evaluator = local(&settings);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);

    let normal = orchestrator.run().await.unwrap();
    assert!(!normal.forced);
    assert_eq!(normal.jobs_queued, 0, "subtitle already present");

    // Legacy marker file dropped by an external trigger.
    std::fs::write(dir.join("data/forced_scan_and_down_sub"), b"").unwrap();
    let forced = orchestrator.run().await.unwrap();
    assert!(forced.forced);
    assert_eq!(forced.jobs_queued, 1);
    assert_eq!(
        orchestrator.flags().record().state(OneShotFlag::ForcedFullRescan),
        FlagState::Inert
    );

    let after = orchestrator.run().await.unwrap();
    assert!(!after.forced, "flag applies to exactly one run");

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 4. test_failed_run_rearms_flags
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_run_rearms_flags() {
    let dir = make_test_dir("rearm");
    let settings = library_settings(&dir, &["missing-movies"], &[]);
    let evaluator = local(&settings);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);
    orchestrator.flags().arm(OneShotFlag::ForcedFullRescan).unwrap();

    let (tx, mut rx) = create_event_channel();
    let orchestrator = orchestrator.with_events(tx);

    let err = orchestrator.run().await.expect_err("missing root must abort");
    assert!(matches!(err, RunError::Scan(_)));
    assert_eq!(err.stage(), RunState::Scanned);
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert_eq!(
        orchestrator.flags().record().state(OneShotFlag::ForcedFullRescan),
        FlagState::Armed
    );

    let mut aborted = false;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::RunAborted { stage, .. } = event {
            assert_eq!(stage, RunState::Scanned);
            aborted = true;
        }
    }
    assert!(aborted);

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 5. test_identity_cache_refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_identity_cache_refresh() {
    let dir = make_test_dir("identity_refresh");
    let alpha = dir.join("movies/Alpha");
    touch(&alpha.join("Alpha.mkv"));
    std::fs::write(alpha.join("Alpha.nfo"), "<movie><imdbid>tt100</imdbid></movie>").unwrap();
    touch(&dir.join("movies/Unknown/Unknown.mkv"));
    let show = dir.join("series/Show");
    touch(&show.join("Show.S01E01.mkv"));
    std::fs::write(show.join("tvshow.nfo"), "<tvshow><imdbid>tt200</imdbid></tvshow>").unwrap();

    let settings = library_settings(&dir, &["movies"], &["series"]);
    let evaluator = local(&settings);
    let store = Arc::new(MemoryIdentityStore::new());
    let orchestrator = build(settings, store.clone(), evaluator, None);

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.cache_updates, 2);
    // The unresolvable movie is skipped, not fatal.
    assert_eq!(summary.item_failures, 1);

    let entries = store.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].external_id, "tt100");
    assert_eq!(entries[0].root_dir, alpha);
    assert!(entries[0].is_movie);
    assert_eq!(entries[1].root_dir, show);
    assert!(!entries[1].is_movie);

    // Unchanged entries are not rewritten.
    let again = orchestrator.run().await.unwrap();
    assert_eq!(again.cache_updates, 0);

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 6. test_catalog_mode_is_exclusive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_catalog_mode_is_exclusive() {
    let dir = make_test_dir("catalog");
    let movie = dir.join("movies/Alpha/Alpha.mkv");
    touch(&movie);
    // Present on disk but not reported by the media server.
    touch(&dir.join("movies/Beta/Beta.mkv"));

    let show = dir.join("series/Show");
    let mut series = BTreeMap::new();
    series.insert(
        show.clone(),
        vec![
            CatalogEpisode {
                physical_path: show.join("Show.S02E03.mkv"),
                series_root_dir: show.clone(),
                item_id: "ep-1".into(),
            },
            CatalogEpisode {
                physical_path: show.join("extras.mkv"),
                series_root_dir: show.clone(),
                item_id: "ep-2".into(),
            },
        ],
    );
    let server = Arc::new(FakeMediaServer {
        result: CatalogResult {
            movies: vec![CatalogMovie {
                physical_path: movie.clone(),
                item_id: "mv-1".into(),
            }],
            series,
        },
        refreshes: AtomicUsize::new(0),
        limits: parking_lot::Mutex::new(Vec::new()),
    });

    let mut settings = library_settings(&dir, &["movies"], &["series"]);
    settings.media_server.enable = true;
    let evaluator = local(&settings);
    let orchestrator = build(
        settings,
        Arc::new(MemoryIdentityStore::new()),
        evaluator,
        Some(server.clone() as Arc<dyn MediaServerClient>),
    );

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.mode, ScanMode::Catalog);
    assert_eq!(summary.jobs_queued, 2);
    assert_eq!(summary.cache_updates, 0, "catalog runs skip the identity cache");
    assert_eq!(server.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(server.limits.lock().as_slice(), &[500]);

    let jobs = orchestrator.queue().snapshot();
    assert!(jobs.iter().all(|j| j.physical_path != dir.join("movies/Beta/Beta.mkv")));
    let episode = jobs.iter().find(|j| j.kind == VideoKind::Series).unwrap();
    assert_eq!((episode.season, episode.episode), (Some(2), Some(3)));
    assert_eq!(episode.external_id.as_deref(), Some("ep-1"));

    let last = orchestrator.last_scan_result().unwrap();
    assert!(last.as_catalog().is_some());
    assert!(last.as_direct().is_none());

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 7. test_catalog_mode_without_client
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_catalog_mode_without_client() {
    let dir = make_test_dir("catalog_missing");
    let mut settings = library_settings(&dir, &[], &[]);
    settings.media_server.enable = true;
    let evaluator = local(&settings);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Catalog(MediaServerError::NotConfigured)
    ));

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 8. test_cancel_during_filter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_during_filter() {
    let dir = make_test_dir("cancel");
    touch(&dir.join("movies/Alpha/Alpha.mkv"));

    let settings = library_settings(&dir, &["movies"], &[]);
    let orchestrator = Arc::new(build(
        settings,
        Arc::new(MemoryIdentityStore::new()),
        Arc::new(StuckEvaluator),
        None,
    ));
    orchestrator.flags().arm(OneShotFlag::ForcedFullRescan).unwrap();

    // Cancelling an idle orchestrator does nothing.
    orchestrator.cancel();
    assert_eq!(orchestrator.state(), RunState::Idle);

    let handle = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };

    let mut waited = Duration::ZERO;
    while orchestrator.state() != RunState::Filtered {
        assert!(waited < Duration::from_secs(5), "run never reached the filter stage");
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    // Give the stuck unit time to be submitted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel();
    assert_eq!(orchestrator.state(), RunState::Idle);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run stops after cancel")
        .unwrap();
    assert!(matches!(
        outcome,
        Err(RunError::Cancelled {
            stage: RunState::Filtered
        })
    ));
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert!(orchestrator.queue().is_empty());
    assert_eq!(
        orchestrator.flags().record().state(OneShotFlag::ForcedFullRescan),
        FlagState::Armed
    );

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 9. test_restore_backups_before_scan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_restore_backups_before_scan() {
    let dir = make_test_dir("restore_run");
    touch(&dir.join("movies/Alpha/Alpha.mkv"));
    std::fs::write(dir.join("movies/Alpha/Alpha.chs.srt.csf-bk"), "original").unwrap();

    let settings = library_settings(&dir, &["movies"], &[]);
    let evaluator = local(&settings);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);
    orchestrator.flags().arm(OneShotFlag::RestoreTimelineBackup).unwrap();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.restored_backups, 1);
    // The restored subtitle counts during filtering.
    assert_eq!(summary.jobs_queued, 0);
    assert_eq!(
        std::fs::read_to_string(dir.join("movies/Alpha/Alpha.chs.srt")).unwrap(),
        "original"
    );

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 10. test_rejected_episode_counts_as_failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rejected_episode_counts_as_failure() {
    let dir = make_test_dir("rejected_episode");
    let show = dir.join("series/Show");
    std::fs::create_dir_all(&show).unwrap();
    std::fs::write(show.join("tvshow.nfo"), "<tvshow><imdbid>tt300</imdbid></tvshow>").unwrap();

    let evaluator = Arc::new(FixedSeriesEvaluator {
        episodes: vec![
            EpisodeInfo {
                title: "Show".into(),
                file_path: show.join("Show.S01E01.mkv"),
                season: 1,
                episode: 1,
            },
            // An empty path is refused by the queue.
            EpisodeInfo {
                title: "Show".into(),
                file_path: PathBuf::new(),
                season: 1,
                episode: 2,
            },
        ],
    });

    let settings = library_settings(&dir, &[], &["series"]);
    let orchestrator = build(settings, Arc::new(MemoryIdentityStore::new()), evaluator, None);

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.jobs_queued, 1);
    assert_eq!(summary.item_failures, 1);

    cleanup(&dir);
}

// ---------------------------------------------------------------------------
// 11. test_identity_cache_persisted_once_per_run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_identity_cache_persisted_once_per_run() {
    let dir = make_test_dir("identity_persist");
    for (name, id) in [("Alpha", "tt401"), ("Beta", "tt402"), ("Gamma", "tt403")] {
        touch(&dir.join(format!("movies/{name}/{name}.mkv")));
        std::fs::write(
            dir.join(format!("movies/{name}/movie.nfo")),
            format!("<movie><imdbid>{id}</imdbid></movie>"),
        )
        .unwrap();
    }

    let settings = library_settings(&dir, &["movies"], &[]);
    let cache_dir = settings.data_dir.join("identity");
    let evaluator = local(&settings);
    let store = Arc::new(FileIdentityStore::open(cache_dir.clone()).await.unwrap());
    let orchestrator = build(settings, store, evaluator, None);

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.cache_updates, 3);

    let reopened = FileIdentityStore::open(cache_dir).await.unwrap();
    assert_eq!(reopened.len(), 3);
    let beta = reopened.get_by_external_id("tt402").await.unwrap().unwrap();
    assert_eq!(beta.root_dir, dir.join("movies/Beta"));
    assert!(beta.is_movie);

    cleanup(&dir);
}
