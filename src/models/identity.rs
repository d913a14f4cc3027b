use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Cached link between a library directory and its external identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCacheEntry {
    pub root_dir: PathBuf,
    pub external_id: String,
    pub is_movie: bool,
}

/// What a metadata resolver learned about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub external_id: String,
    pub is_movie: bool,
}
