//! Playlist handling: readiness gating and the VOD rewrite policy.

use std::path::Path;

use m3u8_rs::{MediaPlaylistType, Playlist};

use crate::error::{Error, ErrorKind, Result};
use crate::resolver::paths;

/// Rewrite a finalized recording playlist for VOD serving.
///
/// Policy: exactly one `#EXT-X-PLAYLIST-TYPE:VOD`, all discontinuity markers
/// preserved, `#EXT-X-ENDLIST` appended when absent. Segment URIs are left
/// untouched; they are validated at fetch time.
pub fn rewrite_vod(bytes: &[u8]) -> Result<Vec<u8>> {
    let playlist = m3u8_rs::parse_playlist_res(bytes).map_err(|_| {
        Error::engine(ErrorKind::VodPlaybackError, "unparseable media playlist")
    })?;
    let mut media = match playlist {
        Playlist::MediaPlaylist(media) => media,
        Playlist::MasterPlaylist(_) => {
            return Err(Error::engine(
                ErrorKind::VodPlaybackError,
                "expected a media playlist, found a master playlist",
            ));
        }
    };

    media.playlist_type = Some(MediaPlaylistType::Vod);
    media.end_list = true;

    let mut out = Vec::with_capacity(bytes.len() + 64);
    media
        .write_to(&mut out)
        .map_err(|e| Error::engine(ErrorKind::VodPlaybackError, e.to_string()))?;
    Ok(out)
}

/// Count segments in the playlist whose URI passes the allow-list and exists
/// inside `dir`.
pub fn ready_segment_count(dir: &Path, playlist_name: &str) -> usize {
    let Ok(bytes) = std::fs::read(dir.join(playlist_name)) else {
        return 0;
    };
    let Ok(Playlist::MediaPlaylist(media)) = m3u8_rs::parse_playlist_res(&bytes) else {
        return 0;
    };
    media
        .segments
        .iter()
        .filter(|segment| {
            paths::allowlisted(&segment.uri).is_some()
                && paths::confined_join(dir, &segment.uri)
                    .map(|p| p.is_file())
                    .unwrap_or(false)
        })
        .count()
}

/// Readiness gate: at least one allow-listed segment on disk.
pub fn playlist_ready(dir: &Path, playlist_name: &str) -> bool {
    ready_segment_count(dir, playlist_name) >= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:4.0,\n\
seg_00000.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXTINF:4.0,\n\
seg_00001.ts\n";

    #[test]
    fn rewrite_adds_vod_type_and_endlist_once() {
        let out = rewrite_vod(LIVE_PLAYLIST.as_bytes()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("#EXT-X-PLAYLIST-TYPE:VOD").count(), 1);
        assert_eq!(text.matches("#EXT-X-ENDLIST").count(), 1);
        assert_eq!(text.matches("#EXT-X-DISCONTINUITY").count(), 1);
        assert!(text.contains("seg_00000.ts"));
        assert!(text.contains("seg_00001.ts"));
    }

    #[test]
    fn rewrite_is_idempotent_on_vod_input() {
        let once = rewrite_vod(LIVE_PLAYLIST.as_bytes()).unwrap();
        let twice = rewrite_vod(&once).unwrap();
        let text = String::from_utf8(twice).unwrap();
        assert_eq!(text.matches("#EXT-X-PLAYLIST-TYPE:VOD").count(), 1);
        assert_eq!(text.matches("#EXT-X-ENDLIST").count(), 1);
    }

    #[test]
    fn rewrite_rejects_garbage() {
        assert!(rewrite_vod(b"not a playlist").is_err());
    }

    #[test]
    fn readiness_requires_segments_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.m3u8"), LIVE_PLAYLIST).unwrap();
        // Playlist references two segments, none on disk yet.
        assert!(!playlist_ready(dir.path(), "index.m3u8"));

        std::fs::write(dir.path().join("seg_00000.ts"), b"x").unwrap();
        assert!(playlist_ready(dir.path(), "index.m3u8"));
        assert_eq!(ready_segment_count(dir.path(), "index.m3u8"), 1);

        std::fs::write(dir.path().join("seg_00001.ts"), b"x").unwrap();
        assert_eq!(ready_segment_count(dir.path(), "index.m3u8"), 2);
    }

    #[test]
    fn readiness_ignores_non_allowlisted_uris() {
        let dir = tempfile::tempdir().unwrap();
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\n../../etc/passwd\n";
        std::fs::write(dir.path().join("index.m3u8"), playlist).unwrap();
        assert!(!playlist_ready(dir.path(), "index.m3u8"));
    }

    #[test]
    fn missing_playlist_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!playlist_ready(dir.path(), "index.m3u8"));
    }
}
