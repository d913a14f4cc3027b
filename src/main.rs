use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "subsweep", version, about = "Find videos missing subtitles and queue them for download")]
struct Cli {
    /// Settings file (JSON)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Movie library root (repeatable)
    #[arg(long = "movie-path")]
    movie_paths: Vec<PathBuf>,

    /// Series library root (repeatable)
    #[arg(long = "series-path")]
    series_paths: Vec<PathBuf>,

    /// Maximum concurrent per-item tasks
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Arm a forced full rescan for the next run
    #[arg(long)]
    forced: bool,

    /// Arm a restore of subtitle timeline backups for the next run
    #[arg(long)]
    restore_backups: bool,

    /// Repeat the scan every SECS seconds until Ctrl-C
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Export queued jobs as JSON to file
    #[arg(long)]
    export_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (logs to stderr)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Build settings
    let mut settings = match cli.config {
        Some(ref path) => subsweep::config::settings::Settings::load(path)?,
        None => subsweep::config::settings::Settings::default(),
    };
    if !cli.movie_paths.is_empty() {
        settings.movie_paths = canonicalize_all(&cli.movie_paths)?;
    }
    if !cli.series_paths.is_empty() {
        settings.series_paths = canonicalize_all(&cli.series_paths)?;
    }
    if let Some(conc) = cli.concurrency {
        settings.executor.concurrency = conc;
    }

    let options = subsweep::app::RunOptions {
        forced: cli.forced,
        restore_backups: cli.restore_backups,
        interval: cli.interval.map(Duration::from_secs),
        export_json: cli.export_json,
    };

    let app = subsweep::app::App::new(settings, options).await?;
    app.run().await
}

fn canonicalize_all(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    paths
        .iter()
        .map(|p| Ok(std::fs::canonicalize(p)?))
        .collect()
}
