//! Artifact resolution.
//!
//! Decides how a target should be played, stamps decisions into tokens, and
//! locates playlist/segment artifacts under strict allow-list and confinement
//! rules.

pub mod decision;
pub mod duration;
pub mod paths;
pub mod playlist;
pub mod recording_id;
pub mod token;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::recording::{RecordingService, RecordingState};
use crate::resolver::decision::{ClientProfile, Decision, MediaInfo};
use crate::resolver::duration::DurationService;
use crate::resolver::paths::ArtifactKind;
use crate::resolver::token::{DecisionTokenSigner, VerifiedDecision};

/// Playlist file name used for every pipeline output directory.
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// A located, servable segment artifact.
#[derive(Debug, Clone)]
pub struct ResolvedSegment {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

/// Playlist bytes ready to serve.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// A full stream decision with its token.
#[derive(Debug, Clone)]
pub struct StreamDecision {
    pub decision: Decision,
    pub token: String,
    pub media: MediaInfo,
    pub duration_seconds: Option<f64>,
    pub is_seekable: bool,
}

/// Resolver over the HLS cache, recording store, and decision policy.
pub struct ArtifactResolver {
    hls_root: PathBuf,
    recordings_dir: PathBuf,
    public_base_url: String,
    profiles: HashMap<String, ClientProfile>,
    signer: DecisionTokenSigner,
    duration: Arc<DurationService>,
    recordings: Arc<RecordingService>,
}

impl ArtifactResolver {
    pub fn new(
        hls_root: PathBuf,
        recordings_dir: PathBuf,
        public_base_url: String,
        profiles: HashMap<String, ClientProfile>,
        signer: DecisionTokenSigner,
        duration: Arc<DurationService>,
        recordings: Arc<RecordingService>,
    ) -> Self {
        Self {
            hls_root,
            recordings_dir,
            public_base_url,
            profiles,
            signer,
            duration,
            recordings,
        }
    }

    pub fn hls_root(&self) -> &Path {
        &self.hls_root
    }

    pub fn duration(&self) -> &Arc<DurationService> {
        &self.duration
    }

    /// Per-session confined artifact directory.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.hls_root.join(session_id)
    }

    fn profile(&self, name: &str) -> Result<&ClientProfile> {
        self.profiles.get(name).ok_or_else(|| {
            Error::precondition(format!("unknown client profile {name:?}"))
        })
    }

    /// Map a canonical recording reference to its confined source file.
    ///
    /// Enigma2 references carry the file path as their last `:` field; only
    /// the file name is honored; every recording is served out of the
    /// configured recordings directory.
    pub fn recording_path(&self, reference: &str) -> Result<PathBuf> {
        let path_part = match reference.rfind(':') {
            Some(idx) if reference[idx + 1..].starts_with('/') => &reference[idx + 1..],
            _ => reference,
        };
        let file_name = Path::new(path_part)
            .file_name()
            .ok_or_else(|| Error::invalid_id("recording reference has no file name"))?;
        Ok(self.recordings_dir.join(file_name))
    }

    /// Stream decision for a recording, probing (single-flight, budgeted)
    /// when the store has no duration yet.
    pub async fn stream_info_recording(
        &self,
        reference: &str,
        profile_name: &str,
    ) -> Result<StreamDecision> {
        let profile = self.profile(profile_name)?;
        let file = self.recording_path(reference)?;
        if !file.is_file() {
            return Err(Error::engine(ErrorKind::VodNotFound, "recording not found"));
        }

        let stored = self.duration.stored_duration(reference).await?;
        let media = self
            .duration
            .probe_recording(reference, &file.to_string_lossy())
            .await?;
        let duration_seconds = match stored {
            Some((seconds, true)) => Some(seconds),
            _ => media.duration_seconds,
        };

        let decision = decision::decide(&media, profile);
        let token = self.signer.issue(reference, &decision)?;
        Ok(StreamDecision {
            decision,
            token,
            media,
            duration_seconds,
            is_seekable: duration_seconds.is_some(),
        })
    }

    /// Stream decision for a live service.
    ///
    /// Live sources are not probed, since probing would consume a tuner. DVB
    /// transport streams are uniform enough to decide statically.
    pub fn stream_info_live(&self, service_ref: &str, profile_name: &str) -> Result<StreamDecision> {
        let profile = self.profile(profile_name)?;
        let media = MediaInfo {
            container: "mpegts".into(),
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            duration_seconds: None,
        };
        let decision = decision::decide(&media, profile);
        let token = self.signer.issue(service_ref, &decision)?;
        Ok(StreamDecision {
            decision,
            token,
            media,
            duration_seconds: None,
            is_seekable: false,
        })
    }

    /// Verify a decision token against the intent target.
    pub fn verify_token(&self, token: &str, target: &str) -> Result<VerifiedDecision> {
        self.signer.verify(token, target)
    }

    /// Locate and serve a recording playlist per its lifecycle state.
    pub async fn resolve_recording_playlist(&self, reference: &str) -> Result<ResolvedPlaylist> {
        let meta = self
            .recordings
            .get(reference)
            .await?
            .ok_or_else(|| Error::engine(ErrorKind::Preparing, "recording not prepared yet"))?;

        match meta.state {
            RecordingState::Unknown | RecordingState::Probing | RecordingState::Preparing => {
                Err(Error::engine(ErrorKind::Preparing, "recording not ready"))
            }
            RecordingState::Failed => {
                if meta.last_error.as_deref() == Some("recording_deleted") {
                    Err(Error::engine(ErrorKind::VodNotFound, "recording deleted"))
                } else {
                    Err(Error::engine(
                        ErrorKind::VodPlaybackError,
                        meta.last_error.unwrap_or_else(|| "preparation failed".into()),
                    ))
                }
            }
            RecordingState::ReadyPartial | RecordingState::ReadyFinal => {
                // Duration finality can land before artifacts exist; until a
                // pipeline has produced a playlist the recording is still
                // preparing from the client's point of view.
                let Some(playlist_path) = meta.playlist_path.as_deref().map(PathBuf::from)
                else {
                    return Err(Error::engine(ErrorKind::Preparing, "artifacts not ready"));
                };
                if !playlist_path.starts_with(&self.hls_root) {
                    return Err(Error::engine(
                        ErrorKind::VodPlaybackError,
                        "playlist escapes the cache root",
                    ));
                }
                let bytes = std::fs::read(&playlist_path).map_err(|_| {
                    Error::engine(ErrorKind::Preparing, "playlist not written yet")
                })?;
                let bytes = if meta.state == RecordingState::ReadyFinal {
                    playlist::rewrite_vod(&bytes)?
                } else {
                    bytes
                };
                Ok(ResolvedPlaylist {
                    bytes,
                    content_type: ArtifactKind::Playlist.content_type(),
                })
            }
        }
    }

    /// Locate a recording segment by name (allow-list + confinement).
    pub async fn resolve_recording_segment(
        &self,
        reference: &str,
        name: &str,
    ) -> Result<ResolvedSegment> {
        let kind = paths::allowlisted(name)
            .ok_or_else(|| Error::invalid_id("segment name not allow-listed"))?;
        let meta = self
            .recordings
            .get(reference)
            .await?
            .filter(|m| m.state.is_ready())
            .ok_or_else(|| Error::engine(ErrorKind::Preparing, "recording not ready"))?;
        let dir = meta
            .playlist_path
            .as_deref()
            .map(PathBuf::from)
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .ok_or_else(|| Error::engine(ErrorKind::Preparing, "artifacts not ready"))?;
        if !dir.starts_with(&self.hls_root) {
            return Err(Error::engine(
                ErrorKind::VodPlaybackError,
                "artifact directory escapes the cache root",
            ));
        }
        let path = paths::confined_join(&dir, name)?;
        if !path.is_file() {
            return Err(Error::engine(ErrorKind::VodNotFound, "segment not found"));
        }
        Ok(ResolvedSegment { path, kind })
    }

    /// Session playlist bytes, gated on at least one servable segment.
    pub fn resolve_session_playlist(&self, session_id: &str) -> Result<ResolvedPlaylist> {
        let dir = self.session_dir(session_id);
        if !playlist::playlist_ready(&dir, PLAYLIST_NAME) {
            return Err(Error::engine(ErrorKind::Preparing, "no media yet"));
        }
        let bytes = std::fs::read(dir.join(PLAYLIST_NAME))
            .map_err(|_| Error::engine(ErrorKind::Preparing, "playlist not written yet"))?;
        Ok(ResolvedPlaylist {
            bytes,
            content_type: ArtifactKind::Playlist.content_type(),
        })
    }

    /// Session segment lookup; identical contract to recordings, different
    /// source. Timeshift resolution goes through here as well.
    pub fn resolve_session_segment(&self, session_id: &str, name: &str) -> Result<ResolvedSegment> {
        let kind = paths::allowlisted(name)
            .ok_or_else(|| Error::invalid_id("segment name not allow-listed"))?;
        let dir = self.session_dir(session_id);
        let path = paths::confined_join(&dir, name)?;
        if !path.is_file() {
            return Err(Error::engine(ErrorKind::VodNotFound, "segment not found"));
        }
        Ok(ResolvedSegment { path, kind })
    }

    /// Playback URL for a ready session.
    pub fn playback_url(&self, session_id: &str, reference: &str, live: bool) -> String {
        if live {
            format!(
                "{}/api/v3/sessions/{}/hls/{}",
                self.public_base_url, session_id, PLAYLIST_NAME
            )
        } else {
            format!(
                "{}/api/v3/recordings/{}/playlist.m3u8",
                self.public_base_url,
                recording_id::encode(reference)
            )
        }
    }
}
