use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::ResolveError;
use crate::models::identity::ResolvedIdentity;
use crate::models::job::VideoKind;

/// Looks up the external identity of a movie file or series directory.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// `kind` is the library the path was found in. A path that cannot be
    /// identified yields [`ResolveError::Unresolvable`], which callers skip.
    async fn resolve_identity(
        &self,
        path: &Path,
        kind: VideoKind,
    ) -> Result<ResolvedIdentity, ResolveError>;
}

/// Resolves identities from Kodi-style `.nfo` sidecar files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NfoMetadataResolver;

impl NfoMetadataResolver {
    pub fn new() -> Self {
        Self
    }

    fn candidates(path: &Path, kind: VideoKind) -> Vec<PathBuf> {
        match kind {
            VideoKind::Movie => {
                let mut out = vec![path.with_extension("nfo")];
                if let Some(dir) = path.parent() {
                    out.push(dir.join("movie.nfo"));
                }
                out
            }
            VideoKind::Series => vec![path.join("tvshow.nfo")],
        }
    }
}

#[async_trait]
impl MetadataResolver for NfoMetadataResolver {
    async fn resolve_identity(
        &self,
        path: &Path,
        kind: VideoKind,
    ) -> Result<ResolvedIdentity, ResolveError> {
        for nfo in Self::candidates(path, kind) {
            let text = match tokio::fs::read(&nfo).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(ResolveError::Io { path: nfo, source }),
            };
            if let Some(identity) = parse_nfo(&text, kind) {
                return Ok(identity);
            }
        }
        Err(ResolveError::Unresolvable(path.to_path_buf()))
    }
}

fn imdb_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)<imdbid>\s*(tt\d+)\s*</imdbid>").unwrap(),
            Regex::new(r#"(?i)<uniqueid[^>]*type\s*=\s*"imdb"[^>]*>\s*(tt\d+)\s*</uniqueid>"#)
                .unwrap(),
            Regex::new(r"(?i)<id>\s*(tt\d+)\s*</id>").unwrap(),
        ]
    })
}

/// Extract an IMDB id and the movie/series classification from NFO text.
pub fn parse_nfo(text: &str, hint: VideoKind) -> Option<ResolvedIdentity> {
    let external_id = imdb_patterns()
        .iter()
        .find_map(|re| re.captures(text))
        .map(|caps| caps[1].to_string())?;

    let lower = text.to_lowercase();
    let is_movie = if lower.contains("<tvshow") || lower.contains("<episodedetails") {
        false
    } else if lower.contains("<movie") {
        true
    } else {
        hint == VideoKind::Movie
    };

    Some(ResolvedIdentity {
        external_id,
        is_movie,
    })
}
