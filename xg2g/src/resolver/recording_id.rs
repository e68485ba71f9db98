//! Recording id codec.
//!
//! Recording ids on the wire are URL-safe base64 (no padding) over the
//! canonical service reference. Decoding is strict: the decoded form must be
//! printable UTF-8, free of path and query metacharacters, and free of any
//! traversal sequence even when path-neutral.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{Error, Result};

/// Encode a canonical service reference as a wire recording id.
pub fn encode(service_ref: &str) -> String {
    URL_SAFE_NO_PAD.encode(service_ref.as_bytes())
}

/// Decode and validate a wire recording id into the canonical reference.
pub fn decode(id: &str) -> Result<String> {
    if id.is_empty() || id.len() > 512 {
        return Err(Error::invalid_id("recording id length out of range"));
    }
    let raw = URL_SAFE_NO_PAD
        .decode(id.as_bytes())
        .map_err(|_| Error::invalid_id("recording id is not valid base64url"))?;
    let decoded = String::from_utf8(raw)
        .map_err(|_| Error::invalid_id("recording id is not valid UTF-8"))?;

    if decoded.is_empty() {
        return Err(Error::invalid_id("recording id decodes to nothing"));
    }
    if decoded
        .chars()
        .any(|c| c.is_control() || matches!(c, '\\' | '?' | '#'))
    {
        return Err(Error::invalid_id(
            "recording id contains forbidden characters",
        ));
    }
    // Traversal is rejected outright, path-neutral or not.
    if decoded.contains("..") {
        return Err(Error::invalid_id("recording id contains traversal"));
    }
    // Path-clean: no segment may be empty-dot or escape upward.
    for segment in decoded.split('/') {
        if segment == "." {
            return Err(Error::invalid_id("recording id contains dot segment"));
        }
    }

    Ok(decoded)
}
