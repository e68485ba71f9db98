//! Artifact name allow-list and path confinement.
//!
//! Segment names are validated before resolution and re-checked after the
//! path join; nothing outside a session's cache directory is ever served.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Kinds of servable artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Playlist,
    SegmentTs,
    SegmentM4s,
    SegmentCmfv,
    Init,
}

impl ArtifactKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Playlist => "application/vnd.apple.mpegurl",
            Self::SegmentTs => "video/mp2t",
            Self::SegmentM4s | Self::SegmentCmfv | Self::Init => "video/mp4",
        }
    }
}

/// Check a segment name against the allow-list: `init.mp4` or
/// `seg_<safe chars>.{ts,m4s,cmfv}`.
pub fn allowlisted(name: &str) -> Option<ArtifactKind> {
    if name == "init.mp4" {
        return Some(ArtifactKind::Init);
    }
    let stem = name.strip_prefix("seg_")?;
    let (body, kind) = if let Some(b) = stem.strip_suffix(".ts") {
        (b, ArtifactKind::SegmentTs)
    } else if let Some(b) = stem.strip_suffix(".m4s") {
        (b, ArtifactKind::SegmentM4s)
    } else if let Some(b) = stem.strip_suffix(".cmfv") {
        (b, ArtifactKind::SegmentCmfv)
    } else {
        return None;
    };
    if body.is_empty() || body.len() > 64 {
        return None;
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some(kind)
}

/// Join an artifact name onto its confined directory.
///
/// The name must already have passed [`allowlisted`]; this re-validates that
/// it contains no separators or traversal and that the joined path stays a
/// direct child of `root`.
pub fn confined_join(root: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
    {
        return Err(Error::invalid_id("artifact name escapes its directory"));
    }
    let joined = root.join(name);
    // Post-join check: still exactly one component below the root.
    if joined.parent() != Some(root) {
        return Err(Error::invalid_id("artifact path escapes its directory"));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_accepts_expected_names() {
        assert_eq!(allowlisted("init.mp4"), Some(ArtifactKind::Init));
        assert_eq!(allowlisted("seg_00001.ts"), Some(ArtifactKind::SegmentTs));
        assert_eq!(allowlisted("seg_abc-1.m4s"), Some(ArtifactKind::SegmentM4s));
        assert_eq!(allowlisted("seg_0.cmfv"), Some(ArtifactKind::SegmentCmfv));
    }

    #[test]
    fn allowlist_rejects_everything_else() {
        for name in [
            "index.m3u8",
            "seg_.ts",
            "seg_00001.mp4",
            "seg_../x.ts",
            "seg_a b.ts",
            "other.ts",
            "init.mp4.bak",
            "seg_00001.TS",
            "",
        ] {
            assert!(allowlisted(name).is_none(), "should reject {name:?}");
        }
    }

    #[test]
    fn confined_join_stays_inside_root() {
        let root = Path::new("/srv/hls/s-1");
        let path = confined_join(root, "seg_00001.ts").unwrap();
        assert_eq!(path, root.join("seg_00001.ts"));
    }

    #[test]
    fn confined_join_rejects_traversal() {
        let root = Path::new("/srv/hls/s-1");
        for name in ["../secret.ts", "a/b.ts", "..", "a\\b.ts", "x\0.ts", ""] {
            assert!(confined_join(root, name).is_err(), "should reject {name:?}");
        }
    }

    #[test]
    fn content_types() {
        assert_eq!(ArtifactKind::Playlist.content_type(), "application/vnd.apple.mpegurl");
        assert_eq!(ArtifactKind::SegmentTs.content_type(), "video/mp2t");
        assert_eq!(ArtifactKind::Init.content_type(), "video/mp4");
    }
}
