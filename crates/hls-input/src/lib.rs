//! # HLS input
//!
//! Turns a remote M3U8 playlist, master or media, into a stream of
//! transport stream packets for the switch engine: variant selection on
//! master playlists, live refresh of updatable media playlists, segment
//! pacing and cookie continuity across all requests of one input.

pub mod error;
pub mod fetcher;
pub mod input;
pub mod options;
pub mod playlist;

pub use error::HlsInputError;
pub use fetcher::{ByteStream, Fetch, HttpFetcher};
pub use input::HlsInput;
pub use options::{HlsInputOptions, HttpOptions, VariantRange, VariantSelection};
pub use playlist::{HlsPlaylist, PlaylistKind, Segment, Variant};

/// Result type for HLS input operations
pub type Result<T> = std::result::Result<T, HlsInputError>;
