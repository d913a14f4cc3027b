//! Season/episode numbers from scene-style file names such as
//! `Show.Name.S02E05.1080p.mkv`, `Show Name 2x05.mkv` or
//! `Show Name Season 2 Episode 5.mkv`.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEpisode {
    pub title: String,
    pub season: u32,
    pub episode: u32,
}

fn patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)^(.*?)\s*\bS(\d{1,2})\s*E(\d{1,3})").unwrap(),
            Regex::new(r"(?i)^(.*?)\s*\b(\d{1,2})x(\d{2,3})\b").unwrap(),
            Regex::new(r"(?i)^(.*?)\s*Season\s*(\d+).*?Episode\s*(\d+)").unwrap(),
        ]
    })
}

/// Parse a bare file name (with or without extension).
pub fn parse_episode(file_name: &str) -> Option<ParsedEpisode> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let cleaned = stem.replace(['.', '_'], " ");

    patterns().iter().find_map(|re| {
        let caps = re.captures(&cleaned)?;
        let season = caps[2].parse().ok()?;
        let episode = caps[3].parse().ok()?;
        let title = caps[1].split_whitespace().collect::<Vec<_>>().join(" ");
        Some(ParsedEpisode {
            title: if title.is_empty() { stem.clone() } else { title },
            season,
            episode,
        })
    })
}

/// Parse the file name component of a full path.
pub fn parse_episode_path(path: &Path) -> Option<ParsedEpisode> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_episode)
}
