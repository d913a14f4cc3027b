use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::settings::RunSettings;
use crate::error::MediaServerError;
use crate::models::scan_result::CatalogResult;

/// Request-scoped parameters for one catalog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    /// Maximum number of recently changed items to inspect.
    pub limit: u32,
    pub language_markers: Vec<String>,
    pub forced: bool,
}

impl CatalogQuery {
    pub fn from_run(run: &RunSettings) -> Self {
        Self {
            limit: run.media_server_limit(),
            language_markers: run.base().subtitle.language_markers.clone(),
            forced: run.forced(),
        }
    }
}

/// The media-server API the catalog scanner depends on.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    /// Ask the server to re-read subtitle files. Returns whether it accepted.
    async fn refresh_subtitle_listing(&self) -> Result<bool, MediaServerError>;

    /// Recently changed movies and episodes that lack the target subtitle.
    async fn recently_added_missing_subtitle(
        &self,
        query: &CatalogQuery,
    ) -> Result<CatalogResult, MediaServerError>;
}

pub struct CatalogScanner {
    client: Option<Arc<dyn MediaServerClient>>,
}

impl CatalogScanner {
    pub fn new(client: Option<Arc<dyn MediaServerClient>>) -> Self {
        Self { client }
    }

    pub async fn scan(&self, run: &RunSettings) -> Result<CatalogResult, MediaServerError> {
        let client = self.client.as_ref().ok_or(MediaServerError::NotConfigured)?;

        info!("Refreshing media server subtitle listing");
        match client.refresh_subtitle_listing().await {
            Ok(true) => info!("Media server subtitle listing refreshed"),
            Ok(false) => error!("Media server declined the subtitle listing refresh"),
            Err(e) => {
                error!(error = %e, "Media server subtitle listing refresh failed");
                return Err(e);
            }
        }

        let query = CatalogQuery::from_run(run);
        info!(limit = query.limit, forced = query.forced, "Querying media server for videos missing subtitles");
        let result = client.recently_added_missing_subtitle(&query).await?;

        for movie in &result.movies {
            debug!(path = %movie.physical_path.display(), item_id = %movie.item_id, "Catalog movie");
        }
        for (series, episodes) in &result.series {
            debug!(series = %series.display(), episodes = episodes.len(), "Catalog series");
        }
        info!(
            movies = result.movies.len(),
            series = result.series.len(),
            "Catalog scan finished"
        );
        Ok(result)
    }
}
