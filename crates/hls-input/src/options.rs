use std::path::PathBuf;
use std::time::Duration;

use crate::HlsInputError;

/// Bounds of the ranged variant selector. A zero bound means "no bound";
/// all non-zero bounds must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VariantRange {
    /// Minimum bitrate in bits per second.
    pub min_bitrate: u64,
    /// Maximum bitrate in bits per second.
    pub max_bitrate: u64,
    pub min_width: u64,
    pub max_width: u64,
    pub min_height: u64,
    pub max_height: u64,
}

impl VariantRange {
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }
}

/// Policy for selecting one variant of a master playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSelection {
    LowestBitrate,
    HighestBitrate,
    LowestResolution,
    HighestResolution,
    /// Highest bitrate among the variants satisfying all bounds. The
    /// default (all bounds zero) selects the highest bitrate overall.
    Ranged(VariantRange),
}

impl Default for VariantSelection {
    fn default() -> Self {
        Self::Ranged(VariantRange::default())
    }
}

/// HTTP client options shared by all requests of one HLS input.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    /// Per-request timeout for playlist downloads.
    pub playlist_fetch_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("strelay/", env!("CARGO_PKG_VERSION")).to_string(),
            playlist_fetch_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Options of one HLS input.
#[derive(Debug, Clone)]
pub struct HlsInputOptions {
    /// URL of the master or media playlist.
    pub url: String,
    pub selection: VariantSelection,
    /// Log every variant of a master playlist.
    pub list_variants: bool,
    /// Save all downloaded playlists and segments into this directory.
    pub save_dir: Option<PathBuf>,
    /// Stop after receiving this many media segments. Zero receives the
    /// complete content.
    pub max_segment_count: usize,
    /// Starting segment in the initial playlist: positive values index
    /// from the start, negative values from the end; -1 is the live
    /// starting point.
    pub start_segment: i64,
    pub http: HttpOptions,
}

impl HlsInputOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selection: VariantSelection::default(),
            list_variants: false,
            save_dir: None,
            max_segment_count: 0,
            start_segment: 0,
            http: HttpOptions::default(),
        }
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<(), HlsInputError> {
        if self.url.is_empty() {
            return Err(HlsInputError::Playlist("no playlist URL".into()));
        }
        Ok(())
    }
}
