//! Single-range byte serving for media artifacts.
//!
//! One range per request; multi-range requests are refused with 416 as the
//! contract requires. Syntactically invalid `Range` headers are ignored per
//! RFC 9110 (the full representation is served).

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Parse outcome for a `Range` header against a representation of `len`
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No (or ignorable) range; serve the whole representation.
    Full,
    /// Single satisfiable range, inclusive bounds.
    Single { start: u64, end: u64 },
    /// 416 with `Content-Range: bytes */len`.
    Unsatisfiable,
}

pub fn parse_range(header_value: Option<&str>, len: u64) -> RangeOutcome {
    let Some(raw) = header_value else {
        return RangeOutcome::Full;
    };
    let Some(spec) = raw.strip_prefix("bytes=") else {
        // Unknown unit: ignore.
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        // Multi-range is refused outright.
        return RangeOutcome::Unsatisfiable;
    }
    let spec = spec.trim();
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    if start_raw.is_empty() {
        // Suffix form: last N bytes.
        let Ok(suffix) = end_raw.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if suffix == 0 || len == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = len.saturating_sub(suffix);
        return RangeOutcome::Single {
            start,
            end: len - 1,
        };
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    if start >= len {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if end_raw.is_empty() {
        len - 1
    } else {
        match end_raw.parse::<u64>() {
            // An end past the representation is clamped.
            Ok(end) => end.min(len - 1),
            Err(_) => return RangeOutcome::Full,
        }
    };
    if end < start {
        // Syntactically invalid; ignore the header.
        return RangeOutcome::Full;
    }
    RangeOutcome::Single { start, end }
}

/// Serve bytes honoring a `Range` header.
pub fn serve_bytes(bytes: Vec<u8>, content_type: &'static str, range: Option<&str>) -> Response {
    let len = bytes.len() as u64;
    match parse_range(range, len) {
        RangeOutcome::Full => {
            let mut response = (StatusCode::OK, bytes).into_response();
            set_media_headers(&mut response, content_type, None, len);
            response
        }
        RangeOutcome::Single { start, end } => {
            let slice = bytes[start as usize..=end as usize].to_vec();
            let mut response = Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .body(Body::from(slice))
                .unwrap_or_default();
            set_media_headers(&mut response, content_type, Some((start, end)), len);
            response
        }
        RangeOutcome::Unsatisfiable => {
            let mut response = Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .body(Body::empty())
                .unwrap_or_default();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{len}")) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_RANGE, value);
            }
            response
        }
    }
}

fn set_media_headers(
    response: &mut Response,
    content_type: &'static str,
    range: Option<(u64, u64)>,
    total: u64,
) {
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some((start, end)) = range
        && let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))
    {
        headers.insert(header::CONTENT_RANGE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: u64 = 4096;

    #[test]
    fn no_header_serves_full() {
        assert_eq!(parse_range(None, LEN), RangeOutcome::Full);
    }

    #[test]
    fn first_byte_range() {
        assert_eq!(
            parse_range(Some("bytes=0-0"), LEN),
            RangeOutcome::Single { start: 0, end: 0 }
        );
    }

    #[test]
    fn suffix_range_takes_the_tail() {
        assert_eq!(
            parse_range(Some("bytes=-100"), LEN),
            RangeOutcome::Single {
                start: 3996,
                end: 4095
            }
        );
        // A suffix larger than the file is the whole file.
        assert_eq!(
            parse_range(Some("bytes=-5000"), LEN),
            RangeOutcome::Single { start: 0, end: 4095 }
        );
    }

    #[test]
    fn out_of_bounds_start_is_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=5000-"), LEN), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=4096-"), LEN), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn multi_range_is_refused() {
        assert_eq!(
            parse_range(Some("bytes=0-0,1-1"), LEN),
            RangeOutcome::Unsatisfiable
        );
    }

    #[test]
    fn open_ended_and_clamped_ranges() {
        assert_eq!(
            parse_range(Some("bytes=4000-"), LEN),
            RangeOutcome::Single {
                start: 4000,
                end: 4095
            }
        );
        assert_eq!(
            parse_range(Some("bytes=4000-9999"), LEN),
            RangeOutcome::Single {
                start: 4000,
                end: 4095
            }
        );
    }

    #[test]
    fn garbage_is_ignored() {
        assert_eq!(parse_range(Some("bytes=a-b"), LEN), RangeOutcome::Full);
        assert_eq!(parse_range(Some("lines=1-2"), LEN), RangeOutcome::Full);
        assert_eq!(parse_range(Some("bytes=5-2"), LEN), RangeOutcome::Full);
    }

    #[test]
    fn serve_bytes_partial_content() {
        let body = vec![7u8; 4096];
        let response = serve_bytes(body, "video/mp2t", Some("bytes=0-0"));
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 0-0/4096"
        );
    }

    #[test]
    fn serve_bytes_unsatisfiable_sets_star_range() {
        let body = vec![7u8; 4096];
        let response = serve_bytes(body, "video/mp2t", Some("bytes=5000-"));
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */4096"
        );
    }
}
