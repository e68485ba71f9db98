//! Playback decision matrix.
//!
//! Profiles are a server-authoritative summary of client capabilities; the
//! client never supplies policy. The matrix is pure so it can be tested
//! exhaustively.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::session::entity::PlaybackMode;

/// Media properties of a source, as probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub duration_seconds: Option<f64>,
}

/// Server-side client capability profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub name: String,
    /// Containers the client plays natively.
    pub containers: Vec<String>,
    /// Codecs the client decodes.
    pub codecs: Vec<String>,
    /// Codecs the server can encode with hardware acceleration.
    pub hw_codecs: Vec<String>,
    /// Codec boosted during transcode selection.
    pub preferred_codec: Option<String>,
    /// When set, the profile mandates this codec for transcodes.
    pub mandated_codec: Option<String>,
    /// Mandated codec must be hardware-encodable.
    pub mandate_requires_hw: bool,
}

impl ClientProfile {
    fn supports_codec(&self, codec: &str) -> bool {
        self.codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }

    fn supports_container(&self, container: &str) -> bool {
        self.containers
            .iter()
            .any(|c| c.eq_ignore_ascii_case(container))
    }

    fn hw_capable(&self, codec: &str) -> bool {
        self.hw_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }
}

/// How the pipeline should treat the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayStrategy {
    DirectPlay,
    Remux,
    TranscodeHw,
    TranscodeCpu,
    Reject,
}

impl PlayStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectPlay => "direct_play",
            Self::Remux => "remux",
            Self::TranscodeHw => "transcode_hw",
            Self::TranscodeCpu => "transcode_cpu",
            Self::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct_play" => Some(Self::DirectPlay),
            "remux" => Some(Self::Remux),
            "transcode_hw" => Some(Self::TranscodeHw),
            "transcode_cpu" => Some(Self::TranscodeCpu),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// A playback decision, stamped into a decision token before it leaves the
/// server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub strategy: PlayStrategy,
    pub mode: PlaybackMode,
    pub reason: String,
    /// Target codec for transcodes.
    pub target_codec: Option<String>,
}

/// Decide how `source` should be played for `profile`.
pub fn decide(source: &MediaInfo, profile: &ClientProfile) -> Decision {
    let codec_ok = profile.supports_codec(&source.video_codec);
    let container_ok = profile.supports_container(&source.container);

    if codec_ok && container_ok {
        let mode = if source.container.eq_ignore_ascii_case("mp4") {
            PlaybackMode::DirectMp4
        } else {
            PlaybackMode::NativeHls
        };
        return Decision {
            strategy: PlayStrategy::DirectPlay,
            mode,
            reason: "codec and container supported".into(),
            target_codec: None,
        };
    }

    if codec_ok {
        return Decision {
            strategy: PlayStrategy::Remux,
            mode: PlaybackMode::Hlsjs,
            reason: format!("container {} unsupported, repackaging", source.container),
            target_codec: None,
        };
    }

    // Transcode path: pick the best codec the client decodes.
    if let Some(mandated) = &profile.mandated_codec
        && profile.mandate_requires_hw
        && !profile.hw_capable(mandated)
    {
        return Decision {
            strategy: PlayStrategy::Reject,
            mode: PlaybackMode::Deny,
            reason: "HW_CODEC_UNAVAILABLE".into(),
            target_codec: Some(mandated.clone()),
        };
    }

    let candidates: Vec<&String> = match &profile.mandated_codec {
        Some(mandated) => profile
            .codecs
            .iter()
            .filter(|c| c.eq_ignore_ascii_case(mandated))
            .collect(),
        None => profile.codecs.iter().collect(),
    };

    let best = candidates.iter().max_by_key(|codec| {
        let mut score = 0u32;
        if profile.hw_capable(codec) {
            score += 2;
        }
        if profile
            .preferred_codec
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(codec))
        {
            score += 1;
        }
        score
    });

    match best {
        Some(codec) => {
            let hw = profile.hw_capable(codec);
            Decision {
                strategy: if hw {
                    PlayStrategy::TranscodeHw
                } else {
                    PlayStrategy::TranscodeCpu
                },
                mode: PlaybackMode::Transcode,
                reason: format!("transcoding {} to {}", source.video_codec, codec),
                target_codec: Some((*codec).clone()),
            }
        }
        None => Decision {
            strategy: PlayStrategy::Reject,
            mode: PlaybackMode::Deny,
            reason: "POLICY_DENIES_TRANSCODE".into(),
            target_codec: None,
        },
    }
}

/// Built-in profile registry; operators override via `XG2G_PROFILES` (JSON
/// array of profiles).
pub fn default_profiles() -> HashMap<String, ClientProfile> {
    let profiles = vec![
        ClientProfile {
            name: "native_hls".into(),
            containers: vec!["mpegts".into(), "mp4".into()],
            codecs: vec!["h264".into(), "aac".into(), "mp3".into()],
            hw_codecs: vec![],
            preferred_codec: None,
            mandated_codec: None,
            mandate_requires_hw: false,
        },
        ClientProfile {
            name: "web".into(),
            containers: vec!["mp4".into()],
            codecs: vec!["h264".into(), "aac".into()],
            hw_codecs: vec!["h264".into()],
            preferred_codec: Some("h264".into()),
            mandated_codec: None,
            mandate_requires_hw: false,
        },
        ClientProfile {
            name: "legacy".into(),
            containers: vec![],
            codecs: vec!["h264".into()],
            hw_codecs: vec![],
            preferred_codec: None,
            mandated_codec: None,
            mandate_requires_hw: false,
        },
    ];
    profiles.into_iter().map(|p| (p.name.clone(), p)).collect()
}

/// Parse an operator profile override from JSON.
pub fn profiles_from_json(raw: &str) -> crate::Result<HashMap<String, ClientProfile>> {
    let profiles: Vec<ClientProfile> = serde_json::from_str(raw)?;
    Ok(profiles.into_iter().map(|p| (p.name.clone(), p)).collect())
}
