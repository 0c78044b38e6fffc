//! HTTP access for playlists and media segments.
//!
//! One fetcher instance serves all requests of one HLS input, with a
//! shared cookie jar so that authentication tokens flow from the master
//! playlist to media playlists and on to media segments.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::Client;
use reqwest::cookie::Jar;
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::options::HttpOptions;
use crate::{HlsInputError, Result};

/// A stream of raw segment bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync>>;

/// Seam between the HLS input and the HTTP layer.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Download a playlist as text.
    async fn fetch_playlist(&self, url: &Url) -> Result<String>;

    /// Open a media segment as a byte stream.
    async fn open_segment(&self, url: &Url) -> Result<ByteStream>;
}

/// Fetcher backed by a reqwest client with a per-input cookie jar.
pub struct HttpFetcher {
    client: Client,
    options: HttpOptions,
    save_dir: Option<PathBuf>,
}

impl HttpFetcher {
    pub fn new(options: &HttpOptions, save_dir: Option<PathBuf>) -> Result<Self> {
        // Platform default TLS configuration with the ring provider.
        let provider = Arc::new(ring::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("Failed to configure default TLS protocol versions")
            .with_platform_verifier()
            .with_no_client_auth();

        let client = Client::builder()
            .user_agent(&options.user_agent)
            .use_preconfigured_tls(tls_config)
            .cookie_provider(Arc::new(Jar::default()))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            options: options.clone(),
            save_dir,
        })
    }

    /// Save a downloaded file under the configured directory, using the
    /// last path segment of its URL as the file name. Failures are logged
    /// and ignored; saving is an observability aid, not part of the data
    /// path.
    async fn save_file(&self, url: &Url, body: &[u8]) {
        let Some(dir) = &self.save_dir else {
            return;
        };
        let path = dir.join(file_name_for(url));
        match tokio::fs::File::create(&path).await {
            Ok(mut file) => {
                if let Err(e) = file.write_all(body).await {
                    warn!(path = %path.display(), error = %e, "could not save downloaded file");
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not create save file");
            }
        }
    }
}

/// Derive a save-file name from the last path segment of a URL.
pub(crate) fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .unwrap_or("download.bin")
        .to_string()
}

/// Create the save directory when configured.
pub(crate) async fn prepare_save_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch_playlist(&self, url: &Url) -> Result<String> {
        debug!(url = %url, "downloading playlist");
        let response = self
            .client
            .get(url.clone())
            .timeout(self.options.playlist_fetch_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HlsInputError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        let body = response.text().await?;
        self.save_file(url, body.as_bytes()).await;
        Ok(body)
    }

    async fn open_segment(&self, url: &Url) -> Result<ByteStream> {
        debug!(url = %url, "downloading segment");
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(HlsInputError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(Box::pin(response.bytes_stream().map_err(HlsInputError::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_for() {
        let url = Url::parse("https://example.com/live/stream/seg-00042.ts?token=x").unwrap();
        assert_eq!(file_name_for(&url), "seg-00042.ts");

        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(file_name_for(&url), "download.bin");
    }
}
