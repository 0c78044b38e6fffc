//! The HLS input plugin.
//!
//! Open phase: load the playlist, select a variant when the URL is a
//! master playlist, position the segment cursor. Run phase: open segment
//! after segment, refreshing live playlists and pacing retries while the
//! server is still expected to produce new segments. Segment bytes are
//! sliced into transport stream packets, carrying the partial-packet
//! remainder across segment boundaries.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::StreamExt;
use switch::{InputPlugin, SwitchError};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use ts::{PACKET_SIZE, PacketMetadata, TsPacket};
use url::Url;

use crate::fetcher::{ByteStream, Fetch, HttpFetcher, file_name_for, prepare_save_dir};
use crate::options::HlsInputOptions;
use crate::playlist::{HlsPlaylist, PlaylistKind};
use crate::{HlsInputError, Result};

/// HLS input: feeds the packets of a remote HLS stream to the switch.
pub struct HlsInput {
    opts: HlsInputOptions,
    url: Url,
    fetcher: Arc<dyn Fetch>,
    playlist: Option<HlsPlaylist>,
    /// Byte stream of the segment currently being read.
    current: Option<ByteStream>,
    /// Raw bytes received but not yet sliced into packets; the tail of a
    /// segment may hold a partial packet completed by the next segment.
    buffer: Vec<u8>,
    /// Media segments consumed in this session.
    consumed: usize,
    save_file: Option<tokio::fs::File>,
}

impl HlsInput {
    /// Create an HLS input over its own HTTP client. The cookie jar lives
    /// as long as the input, so tokens acquired on the master playlist
    /// are presented to media playlists and segments.
    pub fn new(opts: HlsInputOptions) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&opts.http, opts.save_dir.clone())?);
        Self::with_fetcher(opts, fetcher)
    }

    /// Create an HLS input over a caller-provided fetcher.
    pub fn with_fetcher(opts: HlsInputOptions, fetcher: Arc<dyn Fetch>) -> Result<Self> {
        opts.validate()?;
        let url = Url::parse(&opts.url).map_err(|e| HlsInputError::Url {
            url: opts.url.clone(),
            source: e,
        })?;
        Ok(Self {
            opts,
            url,
            fetcher,
            playlist: None,
            current: None,
            buffer: Vec::new(),
            consumed: 0,
            save_file: None,
        })
    }

    /// Open phase: load the playlist, reduce a master playlist to one
    /// media playlist, position the segment cursor.
    async fn open(&mut self) -> Result<()> {
        if let Some(dir) = &self.opts.save_dir {
            prepare_save_dir(dir).await?;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let mut playlist = HlsPlaylist::load(fetcher.as_ref(), self.url.clone()).await?;

        if playlist.kind() == PlaylistKind::Master {
            info!(variants = playlist.variant_count(), "downloaded master playlist");
            if self.opts.list_variants {
                for variant in playlist.variants() {
                    info!(
                        bandwidth = variant.bandwidth,
                        width = variant.width,
                        height = variant.height,
                        url = %variant.url,
                        "variant stream"
                    );
                }
            }
            playlist = self.select_media_playlist(playlist).await?;
        }

        if playlist.kind() != PlaylistKind::Media {
            return Err(HlsInputError::NotMediaPlaylist);
        }
        info!(
            segments = playlist.segment_count(),
            target_duration = playlist.target_duration(),
            live = playlist.updatable(),
            "downloaded media playlist"
        );
        if playlist.segment_count() == 0 {
            return Err(HlsInputError::EmptyPlaylist);
        }

        apply_start_segment(&mut playlist, self.opts.start_segment);

        self.consumed = 0;
        self.buffer.clear();
        self.current = None;
        self.playlist = Some(playlist);
        Ok(())
    }

    /// Apply the selection policy to a master playlist and load the
    /// selected media playlist, deleting variants whose playlist cannot
    /// be fetched and retrying until none is left.
    async fn select_media_playlist(&self, mut master: HlsPlaylist) -> Result<HlsPlaylist> {
        let fetcher = Arc::clone(&self.fetcher);
        let mut deleted_any = false;
        loop {
            let Some(index) = master.select(&self.opts.selection) else {
                return Err(if deleted_any {
                    HlsInputError::NoMorePlaylists
                } else {
                    HlsInputError::NoMatchingStream
                });
            };
            let variant = &master.variants()[index];
            debug!(
                url = %variant.url,
                bandwidth = variant.bandwidth,
                "selected variant stream"
            );

            match HlsPlaylist::load(fetcher.as_ref(), variant.url.clone()).await {
                Ok(media) => return Ok(media),
                Err(e) => {
                    warn!(url = %variant.url, error = %e, "failed to load media playlist");
                    if master.variant_count() == 1 {
                        return Err(HlsInputError::NoMorePlaylists);
                    }
                    master.delete_variant(index);
                    deleted_any = true;
                }
            }
        }
    }

    /// Run phase: open the next media segment, refreshing a live playlist
    /// when it runs short. Returns `None` when the stream completed.
    async fn next_segment(&mut self) -> Result<Option<ByteStream>> {
        let fetcher = Arc::clone(&self.fetcher);
        let Some(playlist) = self.playlist.as_mut() else {
            return Ok(None);
        };

        let mut completed = (self.consumed == 0 && playlist.segment_count() == 0)
            || (self.opts.max_segment_count > 0 && self.consumed >= self.opts.max_segment_count);

        // With one or zero remaining segments, refresh a live playlist.
        if !completed && playlist.segment_count() < 2 && playlist.updatable() {
            // Errors are ignored here; we continue to play what we have.
            if let Err(e) = playlist.reload(fetcher.as_ref()).await {
                debug!(error = %e, "playlist refresh failed, continuing");
            }

            // An empty playlist means we consumed segments faster than the
            // server produces them. New segments may appear until the
            // estimated end of the stream, so retry at half the target
            // duration until then. This time a refresh error stops the
            // retries.
            while playlist.segment_count() == 0
                && SystemTime::now() <= playlist.termination_utc()
            {
                sleep(retry_delay(playlist.target_duration())).await;
                if let Err(e) = playlist.reload(fetcher.as_ref()).await {
                    debug!(error = %e, "playlist refresh failed, stopping retries");
                    break;
                }
            }
            completed = playlist.segment_count() == 0;
        }

        if completed {
            info!(segments = self.consumed, "HLS playlist completed");
            return Ok(None);
        }

        let Some(segment) = playlist.pop_first_segment() else {
            info!(segments = self.consumed, "HLS playlist completed");
            return Ok(None);
        };
        self.consumed += 1;
        debug!(url = %segment.url, sequence = segment.sequence, "opening segment");

        self.open_save_file(&segment.url).await;
        match fetcher.open_segment(&segment.url).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) => {
                // A failed segment download ends the session; the switch
                // core fails over to the next input.
                warn!(url = %segment.url, error = %e, "failed to open segment");
                Ok(None)
            }
        }
    }

    async fn open_save_file(&mut self, url: &Url) {
        self.save_file = None;
        let Some(dir) = &self.opts.save_dir else {
            return;
        };
        let path = dir.join(file_name_for(url));
        match tokio::fs::File::create(&path).await {
            Ok(file) => self.save_file = Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not create segment save file");
            }
        }
    }

    /// Accumulate segment bytes until at least one complete packet is
    /// buffered. Returns false at the end of the input.
    async fn fill(&mut self) -> Result<bool> {
        loop {
            if self.buffer.len() >= PACKET_SIZE {
                return Ok(true);
            }

            let chunk = match self.current.as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    if let Some(file) = self.save_file.as_mut() {
                        if let Err(e) = file.write_all(&bytes).await {
                            warn!(error = %e, "could not save segment data");
                            self.save_file = None;
                        }
                    }
                    self.buffer.extend_from_slice(&bytes);
                }
                Some(Err(e)) => {
                    // Transient read failure: skip to the next segment.
                    warn!(error = %e, "segment read failed");
                    self.current = None;
                }
                None => {
                    self.current = None;
                    self.save_file = None;
                    match self.next_segment().await? {
                        Some(stream) => self.current = Some(stream),
                        None => {
                            if !self.buffer.is_empty() {
                                debug!(
                                    bytes = self.buffer.len(),
                                    "dropping trailing partial packet"
                                );
                                self.buffer.clear();
                            }
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }
}

/// Position the segment cursor of a freshly loaded playlist: drop
/// segments from the head until only the requested window remains.
fn apply_start_segment(playlist: &mut HlsPlaylist, start_segment: i64) {
    let count = playlist.segment_count();
    let keep = if start_segment > 0 {
        let start = start_segment as usize;
        if count + 1 < start {
            warn!(count, "playlist has only {count} segments, starting at the last one");
            1
        } else {
            count.saturating_sub(start)
        }
    } else if start_segment < 0 {
        let wanted = start_segment.unsigned_abs() as usize;
        if count < wanted {
            warn!(count, "playlist has only {count} segments, starting at the first one");
            count
        } else {
            wanted
        }
    } else {
        count
    };

    while playlist.segment_count() > keep {
        playlist.pop_first_segment();
    }
    debug!(remaining = playlist.segment_count(), "segment cursor positioned");
}

/// Delay between refresh retries of an empty live playlist: half the
/// target duration, at least two seconds.
fn retry_delay(target_duration: u64) -> Duration {
    Duration::from_millis(target_duration * 500).max(Duration::from_secs(2))
}

#[async_trait]
impl InputPlugin for HlsInput {
    fn name(&self) -> &str {
        "hls"
    }

    async fn start(&mut self) -> switch::Result<()> {
        self.open().await.map_err(SwitchError::from)
    }

    async fn receive(
        &mut self,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> switch::Result<usize> {
        if !self.fill().await.map_err(SwitchError::from)? {
            return Ok(0);
        }
        let count = packets.len().min(self.buffer.len() / PACKET_SIZE);
        for (index, packet) in packets[..count].iter_mut().enumerate() {
            let offset = index * PACKET_SIZE;
            *packet = TsPacket::from_slice(&self.buffer[offset..offset + PACKET_SIZE])
                .map_err(SwitchError::input)?;
        }
        self.buffer.drain(..count * PACKET_SIZE);
        Ok(count)
    }

    async fn stop(&mut self) -> switch::Result<()> {
        debug!(segments = self.consumed, "closing HLS input");
        self.current = None;
        self.save_file = None;
        self.playlist = None;
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{VariantRange, VariantSelection};
    use bytes::Bytes;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    const MASTER_URL: &str = "https://example.com/hls/index.m3u8";

    const MASTER: &str = "#EXTM3U\n\
        #EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\n\
        low.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720\n\
        mid.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
        high.m3u8\n";

    #[derive(Default)]
    struct MockFetch {
        playlists: Mutex<HashMap<String, VecDeque<std::result::Result<String, ()>>>>,
        segments: Mutex<HashMap<String, Vec<u8>>>,
        log: Mutex<Vec<String>>,
    }

    impl MockFetch {
        fn playlist(&self, url: &str, body: &str) {
            self.playlists
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Ok(body.to_string()));
        }

        fn playlist_error(&self, url: &str) {
            self.playlists
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Err(()));
        }

        fn segment(&self, url: &str, bytes: Vec<u8>) {
            self.segments
                .lock()
                .unwrap()
                .insert(url.to_string(), bytes);
        }

        fn fetches_of(&self, url: &str) -> usize {
            self.log.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl Fetch for MockFetch {
        async fn fetch_playlist(&self, url: &Url) -> Result<String> {
            self.log.lock().unwrap().push(url.to_string());
            let mut playlists = self.playlists.lock().unwrap();
            let queue = playlists
                .get_mut(url.as_str())
                .ok_or_else(|| HlsInputError::Playlist(format!("unexpected fetch of {url}")))?;
            // The last response of a queue is sticky.
            let item = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            };
            item.map_err(|_| HlsInputError::Status {
                url: url.to_string(),
                status: reqwest::StatusCode::NOT_FOUND,
            })
        }

        async fn open_segment(&self, url: &Url) -> Result<ByteStream> {
            self.log.lock().unwrap().push(url.to_string());
            let segments = self.segments.lock().unwrap();
            match segments.get(url.as_str()) {
                Some(bytes) => {
                    let chunk = Ok::<Bytes, HlsInputError>(Bytes::from(bytes.clone()));
                    Ok(Box::pin(futures::stream::iter(vec![chunk])))
                }
                None => Err(HlsInputError::Status {
                    url: url.to_string(),
                    status: reqwest::StatusCode::NOT_FOUND,
                }),
            }
        }
    }

    fn media_playlist(sequence: u64, names: &[&str], live: bool) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:{sequence}\n"
        );
        for name in names {
            text.push_str(&format!("#EXTINF:6.0,\n{name}\n"));
        }
        if !live {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        text
    }

    fn hls_input(fetch: Arc<MockFetch>, opts: HlsInputOptions) -> HlsInput {
        HlsInput::with_fetcher(opts, fetch).unwrap()
    }

    fn capped_options() -> HlsInputOptions {
        let mut opts = HlsInputOptions::new(MASTER_URL);
        opts.selection = VariantSelection::Ranged(VariantRange {
            max_bitrate: 2_000_000,
            ..Default::default()
        });
        opts
    }

    #[tokio::test]
    async fn test_master_selection_bitrate_cap() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, MASTER);
        fetch.playlist(
            "https://example.com/hls/mid.m3u8",
            &media_playlist(0, &["seg0.ts"], false),
        );

        let mut input = hls_input(Arc::clone(&fetch), capped_options());
        input.open().await.unwrap();

        // The 1500 kb/s variant is the best one under the cap.
        assert_eq!(fetch.fetches_of("https://example.com/hls/mid.m3u8"), 1);
        assert_eq!(fetch.fetches_of("https://example.com/hls/low.m3u8"), 0);
        assert_eq!(
            input.playlist.as_ref().unwrap().url().as_str(),
            "https://example.com/hls/mid.m3u8"
        );
    }

    #[tokio::test]
    async fn test_master_selection_retries_deleted_variant() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, MASTER);
        fetch.playlist_error("https://example.com/hls/mid.m3u8");
        fetch.playlist(
            "https://example.com/hls/low.m3u8",
            &media_playlist(0, &["seg0.ts"], false),
        );

        let mut input = hls_input(Arc::clone(&fetch), capped_options());
        input.open().await.unwrap();

        // The failing 1500 kb/s variant was dropped and the 500 kb/s one
        // selected next.
        assert_eq!(fetch.fetches_of("https://example.com/hls/mid.m3u8"), 1);
        assert_eq!(
            input.playlist.as_ref().unwrap().url().as_str(),
            "https://example.com/hls/low.m3u8"
        );
    }

    #[tokio::test]
    async fn test_master_selection_exhaustion() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, MASTER);
        fetch.playlist_error("https://example.com/hls/mid.m3u8");
        fetch.playlist_error("https://example.com/hls/low.m3u8");

        let mut input = hls_input(Arc::clone(&fetch), capped_options());
        let err = input.open().await.unwrap_err();
        assert!(matches!(err, HlsInputError::NoMorePlaylists));
    }

    #[tokio::test]
    async fn test_master_no_matching_stream() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, MASTER);

        let mut opts = HlsInputOptions::new(MASTER_URL);
        opts.selection = VariantSelection::Ranged(VariantRange {
            min_bitrate: 10_000_000,
            ..Default::default()
        });
        let mut input = hls_input(Arc::clone(&fetch), opts);
        let err = input.open().await.unwrap_err();
        assert!(matches!(err, HlsInputError::NoMatchingStream));
    }

    #[tokio::test]
    async fn test_empty_media_playlist_fails() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, &media_playlist(0, &[], false));

        let mut input = hls_input(Arc::clone(&fetch), HlsInputOptions::new(MASTER_URL));
        let err = input.open().await.unwrap_err();
        assert!(matches!(err, HlsInputError::EmptyPlaylist));
    }

    #[tokio::test]
    async fn test_receive_packetizes_across_segments() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(
            MASTER_URL,
            &media_playlist(0, &["seg0.ts", "seg1.ts"], false),
        );

        // 564 bytes in total, split so that a packet straddles the
        // segment boundary.
        let body: Vec<u8> = (0..3 * PACKET_SIZE).map(|i| (i % 251) as u8).collect();
        fetch.segment("https://example.com/hls/seg0.ts", body[..282].to_vec());
        fetch.segment("https://example.com/hls/seg1.ts", body[282..].to_vec());

        let mut input = hls_input(Arc::clone(&fetch), HlsInputOptions::new(MASTER_URL));
        input.start().await.unwrap();

        let mut packets = vec![TsPacket::NULL; 8];
        let mut metadata = vec![PacketMetadata::default(); 8];
        let mut received = Vec::new();
        loop {
            let count = input.receive(&mut packets, &mut metadata).await.unwrap();
            if count == 0 {
                break;
            }
            for packet in &packets[..count] {
                received.extend_from_slice(packet.as_bytes());
            }
        }

        assert_eq!(received, body);
        input.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_segment_count_limit() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(
            MASTER_URL,
            &media_playlist(0, &["seg0.ts", "seg1.ts", "seg2.ts"], false),
        );
        for name in ["seg0.ts", "seg1.ts", "seg2.ts"] {
            fetch.segment(
                &format!("https://example.com/hls/{name}"),
                vec![0x47; PACKET_SIZE],
            );
        }

        let mut opts = HlsInputOptions::new(MASTER_URL);
        opts.max_segment_count = 2;
        let mut input = hls_input(Arc::clone(&fetch), opts);
        input.start().await.unwrap();

        let mut packets = vec![TsPacket::NULL; 4];
        let mut metadata = vec![PacketMetadata::default(); 4];
        let mut total = 0;
        loop {
            let count = input.receive(&mut packets, &mut metadata).await.unwrap();
            if count == 0 {
                break;
            }
            total += count;
        }

        assert_eq!(total, 2);
        assert_eq!(input.consumed, 2);
        assert_eq!(fetch.fetches_of("https://example.com/hls/seg2.ts"), 0);
    }

    #[tokio::test]
    async fn test_live_starts_at_last_segment() {
        let names: Vec<String> = (0..10).map(|i| format!("seg{i}.ts")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, &media_playlist(100, &name_refs, true));

        let mut opts = HlsInputOptions::new(MASTER_URL);
        opts.start_segment = -1;
        let mut input = hls_input(Arc::clone(&fetch), opts);
        input.open().await.unwrap();

        let playlist = input.playlist.as_mut().unwrap();
        assert_eq!(playlist.segment_count(), 1);
        let segment = playlist.pop_first_segment().unwrap();
        assert_eq!(segment.sequence, 109);
    }

    #[tokio::test]
    async fn test_reload_when_playlist_runs_short() {
        let fetch = Arc::new(MockFetch::default());
        fetch.playlist(MASTER_URL, &media_playlist(100, &["seg100.ts", "seg101.ts"], true));
        // The refresh overlaps by one already-seen segment.
        fetch.playlist(MASTER_URL, &media_playlist(101, &["seg101.ts", "seg102.ts"], true));
        for name in ["seg100.ts", "seg101.ts", "seg102.ts"] {
            fetch.segment(
                &format!("https://example.com/hls/{name}"),
                vec![0x47; PACKET_SIZE],
            );
        }

        let mut input = hls_input(Arc::clone(&fetch), HlsInputOptions::new(MASTER_URL));
        input.open().await.unwrap();
        assert_eq!(fetch.fetches_of(MASTER_URL), 1);

        // Two segments buffered: no refresh on the first pop.
        assert!(input.next_segment().await.unwrap().is_some());
        assert_eq!(fetch.fetches_of(MASTER_URL), 1);

        // One segment left: the playlist is refreshed and segment 102
        // appended exactly once.
        assert!(input.next_segment().await.unwrap().is_some());
        assert_eq!(fetch.fetches_of(MASTER_URL), 2);
        assert_eq!(input.playlist.as_ref().unwrap().segment_count(), 1);
        assert!(input.next_segment().await.unwrap().is_some());
        assert_eq!(input.consumed, 3);
    }

    #[test]
    fn test_retry_delay_bounds() {
        assert_eq!(retry_delay(6), Duration::from_secs(3));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(0), Duration::from_secs(2));
    }

    #[test]
    fn test_apply_start_segment() {
        let url = Url::parse(MASTER_URL).unwrap();
        let names: Vec<String> = (0..10).map(|i| format!("seg{i}.ts")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let text = media_playlist(0, &name_refs, true);

        // Zero keeps everything.
        let mut playlist = HlsPlaylist::from_text(&url, &text).unwrap();
        apply_start_segment(&mut playlist, 0);
        assert_eq!(playlist.segment_count(), 10);

        // Positive: offset from the head.
        let mut playlist = HlsPlaylist::from_text(&url, &text).unwrap();
        apply_start_segment(&mut playlist, 3);
        assert_eq!(playlist.segment_count(), 7);
        assert_eq!(playlist.pop_first_segment().unwrap().sequence, 3);

        // Positive beyond the end: keep the last segment only.
        let mut playlist = HlsPlaylist::from_text(&url, &text).unwrap();
        apply_start_segment(&mut playlist, 25);
        assert_eq!(playlist.segment_count(), 1);
        assert_eq!(playlist.pop_first_segment().unwrap().sequence, 9);

        // Negative: offset from the tail.
        let mut playlist = HlsPlaylist::from_text(&url, &text).unwrap();
        apply_start_segment(&mut playlist, -4);
        assert_eq!(playlist.segment_count(), 4);
        assert_eq!(playlist.pop_first_segment().unwrap().sequence, 6);

        // Negative beyond the start: keep everything.
        let mut playlist = HlsPlaylist::from_text(&url, &text).unwrap();
        apply_start_segment(&mut playlist, -15);
        assert_eq!(playlist.segment_count(), 10);
    }
}
