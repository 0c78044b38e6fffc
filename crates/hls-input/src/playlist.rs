//! HLS playlist model.
//!
//! A thin domain layer over `m3u8-rs`: variant selection for master
//! playlists, a FIFO segment queue for media playlists, and live refresh
//! that appends only segments not seen before, tracked by media sequence
//! number.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use m3u8_rs::Playlist;
use tracing::debug;
use url::Url;

use crate::fetcher::Fetch;
use crate::options::{VariantRange, VariantSelection};
use crate::{HlsInputError, Result};

/// Kind of a loaded playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
    /// Not loaded or unrecognized.
    Unknown,
}

/// One variant stream of a master playlist.
#[derive(Debug, Clone)]
pub struct Variant {
    pub url: Url,
    /// Peak bitrate in bits per second.
    pub bandwidth: u64,
    /// Zero when the master carries no resolution for this variant.
    pub width: u64,
    pub height: u64,
}

impl Variant {
    fn pixels(&self) -> u64 {
        self.width * self.height
    }
}

/// One media segment of a media playlist.
#[derive(Debug, Clone)]
pub struct Segment {
    pub url: Url,
    /// Duration in seconds.
    pub duration: f32,
    /// Media sequence number.
    pub sequence: u64,
}

/// A loaded master or media playlist.
pub struct HlsPlaylist {
    url: Url,
    kind: PlaylistKind,
    variants: Vec<Variant>,
    segments: VecDeque<Segment>,
    /// Target segment duration in seconds.
    target_duration: u64,
    end_list: bool,
    /// First media sequence number not seen yet; refresh appends only
    /// segments at or past this point.
    next_sequence: u64,
    /// Estimated wall-clock deadline for new segments to appear in a live
    /// playlist.
    termination: SystemTime,
}

impl HlsPlaylist {
    /// Download and parse a playlist.
    pub async fn load(fetcher: &dyn Fetch, url: Url) -> Result<Self> {
        let text = fetcher.fetch_playlist(&url).await?;
        let playlist = Self::from_text(&url, &text)?;
        debug!(
            url = %url,
            kind = ?playlist.kind,
            variants = playlist.variants.len(),
            segments = playlist.segments.len(),
            "playlist loaded"
        );
        Ok(playlist)
    }

    /// Parse playlist text. Relative variant and segment URIs are
    /// resolved against `url`.
    pub fn from_text(url: &Url, text: &str) -> Result<Self> {
        match m3u8_rs::parse_playlist_res(text.as_bytes()) {
            Ok(Playlist::MasterPlaylist(master)) => {
                let mut variants = Vec::new();
                for variant in &master.variants {
                    if variant.is_i_frame {
                        continue;
                    }
                    let variant_url =
                        url.join(&variant.uri).map_err(|e| HlsInputError::Url {
                            url: variant.uri.clone(),
                            source: e,
                        })?;
                    let (width, height) = variant
                        .resolution
                        .map(|r| (r.width, r.height))
                        .unwrap_or((0, 0));
                    variants.push(Variant {
                        url: variant_url,
                        bandwidth: variant.bandwidth,
                        width,
                        height,
                    });
                }
                Ok(Self {
                    url: url.clone(),
                    kind: PlaylistKind::Master,
                    variants,
                    segments: VecDeque::new(),
                    target_duration: 0,
                    end_list: true,
                    next_sequence: 0,
                    termination: SystemTime::now(),
                })
            }
            Ok(Playlist::MediaPlaylist(media)) => {
                let mut segments = VecDeque::new();
                for (index, segment) in media.segments.iter().enumerate() {
                    let segment_url = url.join(&segment.uri).map_err(|e| HlsInputError::Url {
                        url: segment.uri.clone(),
                        source: e,
                    })?;
                    segments.push_back(Segment {
                        url: segment_url,
                        duration: segment.duration,
                        sequence: media.media_sequence + index as u64,
                    });
                }
                let count = segments.len() as u64;
                Ok(Self {
                    url: url.clone(),
                    kind: PlaylistKind::Media,
                    variants: Vec::new(),
                    next_sequence: media.media_sequence + count,
                    segments,
                    target_duration: media.target_duration as u64,
                    end_list: media.end_list,
                    termination: SystemTime::now()
                        + Duration::from_secs(media.target_duration as u64 * count),
                })
            }
            Err(e) => Err(HlsInputError::Playlist(format!(
                "failed to parse playlist {url}: {e}"
            ))),
        }
    }

    /// Refresh a live media playlist in place. Already seen segments are
    /// skipped; new ones are appended in order.
    pub async fn reload(&mut self, fetcher: &dyn Fetch) -> Result<()> {
        if self.kind != PlaylistKind::Media || !self.updatable() {
            return Ok(());
        }
        let text = fetcher.fetch_playlist(&self.url).await?;
        let fresh = Self::from_text(&self.url, &text)?;
        if fresh.kind != PlaylistKind::Media {
            return Err(HlsInputError::Playlist(format!(
                "expected a media playlist on refresh of {}",
                self.url
            )));
        }
        self.merge_refresh(fresh);
        Ok(())
    }

    pub(crate) fn merge_refresh(&mut self, fresh: HlsPlaylist) {
        let mut added = 0usize;
        for segment in fresh.segments {
            if segment.sequence >= self.next_sequence {
                self.segments.push_back(segment);
                added += 1;
            }
        }
        self.next_sequence = self.next_sequence.max(fresh.next_sequence);
        self.target_duration = fresh.target_duration;
        self.end_list = fresh.end_list;
        self.termination = fresh.termination;
        debug!(added, remaining = self.segments.len(), "media playlist refreshed");
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> PlaylistKind {
        self.kind
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Remove a variant, typically after its media playlist failed to
    /// load.
    pub fn delete_variant(&mut self, index: usize) {
        self.variants.remove(index);
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Pop the oldest media segment.
    pub fn pop_first_segment(&mut self) -> Option<Segment> {
        self.segments.pop_front()
    }

    /// Target segment duration in seconds.
    pub fn target_duration(&self) -> u64 {
        self.target_duration
    }

    /// A playlist without an endlist tag is live and eligible for
    /// periodic refresh.
    pub fn updatable(&self) -> bool {
        !self.end_list
    }

    /// Wall-clock deadline for new segments to appear in a live playlist.
    pub fn termination_utc(&self) -> SystemTime {
        self.termination
    }

    /// Apply a selection policy to the variants of a master playlist.
    pub fn select(&self, selection: &VariantSelection) -> Option<usize> {
        match selection {
            VariantSelection::LowestBitrate => self.select_lowest_bitrate(),
            VariantSelection::HighestBitrate => self.select_highest_bitrate(),
            VariantSelection::LowestResolution => self.select_lowest_resolution(),
            VariantSelection::HighestResolution => self.select_highest_resolution(),
            VariantSelection::Ranged(range) => self.select_ranged(range),
        }
    }

    pub fn select_lowest_bitrate(&self) -> Option<usize> {
        (0..self.variants.len()).min_by_key(|&i| self.variants[i].bandwidth)
    }

    pub fn select_highest_bitrate(&self) -> Option<usize> {
        (0..self.variants.len()).max_by_key(|&i| self.variants[i].bandwidth)
    }

    pub fn select_lowest_resolution(&self) -> Option<usize> {
        (0..self.variants.len()).min_by_key(|&i| self.variants[i].pixels())
    }

    pub fn select_highest_resolution(&self) -> Option<usize> {
        (0..self.variants.len()).max_by_key(|&i| self.variants[i].pixels())
    }

    /// Ranged selection: every non-zero bound must hold; among the
    /// matching variants, the one with the highest bitrate wins.
    pub fn select_ranged(&self, range: &VariantRange) -> Option<usize> {
        (0..self.variants.len())
            .filter(|&i| {
                let v = &self.variants[i];
                (range.min_bitrate == 0 || v.bandwidth >= range.min_bitrate)
                    && (range.max_bitrate == 0 || v.bandwidth <= range.max_bitrate)
                    && (range.min_width == 0 || v.width >= range.min_width)
                    && (range.max_width == 0 || v.width <= range.max_width)
                    && (range.min_height == 0 || v.height >= range.min_height)
                    && (range.max_height == 0 || v.height <= range.max_height)
            })
            .max_by_key(|&i| self.variants[i].bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
        #EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\n\
        low.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720\n\
        mid.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
        high.m3u8\n";

    const MEDIA_VOD: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:6\n\
        #EXT-X-MEDIA-SEQUENCE:0\n\
        #EXTINF:6.0,\n\
        seg0.ts\n\
        #EXTINF:6.0,\n\
        seg1.ts\n\
        #EXTINF:4.0,\n\
        seg2.ts\n\
        #EXT-X-ENDLIST\n";

    const MEDIA_LIVE: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:6\n\
        #EXT-X-MEDIA-SEQUENCE:100\n\
        #EXTINF:6.0,\n\
        seg100.ts\n\
        #EXTINF:6.0,\n\
        seg101.ts\n";

    fn base_url() -> Url {
        Url::parse("https://example.com/hls/index.m3u8").unwrap()
    }

    fn master() -> HlsPlaylist {
        HlsPlaylist::from_text(&base_url(), MASTER).unwrap()
    }

    #[test]
    fn test_parse_master() {
        let playlist = master();
        assert_eq!(playlist.kind(), PlaylistKind::Master);
        assert_eq!(playlist.variant_count(), 3);
        assert_eq!(
            playlist.variants()[0].url.as_str(),
            "https://example.com/hls/low.m3u8"
        );
        assert_eq!(playlist.variants()[1].bandwidth, 1_500_000);
        assert_eq!(playlist.variants()[2].height, 1080);
    }

    #[test]
    fn test_parse_media() {
        let playlist = HlsPlaylist::from_text(&base_url(), MEDIA_VOD).unwrap();
        assert_eq!(playlist.kind(), PlaylistKind::Media);
        assert_eq!(playlist.segment_count(), 3);
        assert_eq!(playlist.target_duration(), 6);
        assert!(!playlist.updatable());
    }

    #[test]
    fn test_parse_live_media() {
        let playlist = HlsPlaylist::from_text(&base_url(), MEDIA_LIVE).unwrap();
        assert!(playlist.updatable());
        // Estimated termination is in the future: two 6 s segments ahead.
        assert!(playlist.termination_utc() > SystemTime::now());
    }

    #[test]
    fn test_segments_pop_fifo() {
        let mut playlist = HlsPlaylist::from_text(&base_url(), MEDIA_VOD).unwrap();
        let first = playlist.pop_first_segment().unwrap();
        assert_eq!(first.url.as_str(), "https://example.com/hls/seg0.ts");
        assert_eq!(first.sequence, 0);
        assert_eq!(playlist.segment_count(), 2);
    }

    #[test]
    fn test_single_criterion_selectors() {
        let playlist = master();
        assert_eq!(playlist.select_lowest_bitrate(), Some(0));
        assert_eq!(playlist.select_highest_bitrate(), Some(2));
        assert_eq!(playlist.select_lowest_resolution(), Some(0));
        assert_eq!(playlist.select_highest_resolution(), Some(2));
    }

    #[test]
    fn test_selectors_on_empty_master() {
        let mut playlist = master();
        playlist.delete_variant(0);
        playlist.delete_variant(0);
        playlist.delete_variant(0);
        assert_eq!(playlist.select_lowest_bitrate(), None);
        assert_eq!(playlist.select_ranged(&VariantRange::default()), None);
    }

    #[test]
    fn test_ranged_selection() {
        let playlist = master();

        // All bounds zero: highest bitrate overall.
        assert_eq!(playlist.select_ranged(&VariantRange::default()), Some(2));

        // Bitrate cap: the best variant still below it.
        let range = VariantRange {
            max_bitrate: 2_000_000,
            ..Default::default()
        };
        assert_eq!(playlist.select_ranged(&range), Some(1));

        // All conditions must hold.
        let range = VariantRange {
            max_bitrate: 2_000_000,
            min_height: 1000,
            ..Default::default()
        };
        assert_eq!(playlist.select_ranged(&range), None);
    }

    #[test]
    fn test_refresh_appends_only_unseen() {
        let mut playlist = HlsPlaylist::from_text(&base_url(), MEDIA_LIVE).unwrap();
        playlist.pop_first_segment();
        playlist.pop_first_segment();
        assert_eq!(playlist.segment_count(), 0);

        // The refreshed playlist still contains segment 101, plus 102.
        let refreshed = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXT-X-MEDIA-SEQUENCE:101\n\
            #EXTINF:6.0,\n\
            seg101.ts\n\
            #EXTINF:6.0,\n\
            seg102.ts\n";
        let fresh = HlsPlaylist::from_text(&base_url(), refreshed).unwrap();
        playlist.merge_refresh(fresh);

        assert_eq!(playlist.segment_count(), 1);
        let segment = playlist.pop_first_segment().unwrap();
        assert_eq!(segment.sequence, 102);
        assert_eq!(segment.url.as_str(), "https://example.com/hls/seg102.ts");
    }

    #[test]
    fn test_refresh_with_endlist_stops_updating() {
        let mut playlist = HlsPlaylist::from_text(&base_url(), MEDIA_LIVE).unwrap();
        let ended = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXT-X-MEDIA-SEQUENCE:102\n\
            #EXTINF:6.0,\n\
            seg102.ts\n\
            #EXT-X-ENDLIST\n";
        let fresh = HlsPlaylist::from_text(&base_url(), ended).unwrap();
        playlist.merge_refresh(fresh);
        assert!(!playlist.updatable());
        assert_eq!(playlist.segment_count(), 3);
    }
}
