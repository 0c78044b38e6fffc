use switch::SwitchError;
use thiserror::Error;

/// Errors of the HLS input family
#[derive(Error, Debug)]
pub enum HlsInputError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Server returned status {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Playlist error: {0}")]
    Playlist(String),

    #[error("Could not find a matching stream in master playlist")]
    NoMatchingStream,

    #[error("No more media playlist to try")]
    NoMorePlaylists,

    #[error("Invalid HLS playlist type, expected a media playlist")]
    NotMediaPlaylist,

    #[error("Empty HLS media playlist")]
    EmptyPlaylist,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HlsInputError> for SwitchError {
    fn from(err: HlsInputError) -> Self {
        SwitchError::input(err)
    }
}
