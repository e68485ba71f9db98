//! Upstream OpenWebIF access.
//!
//! The receiver is an external collaborator; the engine only needs a narrow
//! surface: resolving live stream URLs, availability checks for failure
//! classification, and recording deletion. One reqwest-backed production
//! implementation, one scriptable in-memory implementation for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::error::{Error, ErrorKind, Result};

/// Narrow upstream interface consumed by the engine.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Resolve the direct stream URL for a live service reference.
    async fn stream_url(&self, service_ref: &str) -> Result<Url>;

    /// HEAD an upstream URL; returns the status code. Used to classify
    /// pipeline failures as upstream vs. local.
    async fn head(&self, url: &Url) -> Result<u16>;

    /// Delete a recording on the receiver.
    async fn delete_recording(&self, service_ref: &str) -> Result<()>;

    /// Cheap reachability check for readiness reporting.
    async fn ping(&self) -> Result<()>;
}

/// reqwest-backed OpenWebIF client.
pub struct OpenWebIfClient {
    base: Url,
    client: reqwest::Client,
}

impl OpenWebIfClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::config(format!("invalid OpenWebIF URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base, client })
    }

    /// Upstream status mapping: 404, 403, 504, and 500 keep their meaning;
    /// everything else is the gateway's problem (502).
    fn map_status(status: reqwest::StatusCode) -> Option<Error> {
        if status.is_success() {
            return None;
        }
        let kind = match status.as_u16() {
            401 | 403 => ErrorKind::UpstreamAuth,
            404 => ErrorKind::VodNotFound,
            500 => ErrorKind::InternalError,
            504 => ErrorKind::UpstreamTimeout,
            _ => ErrorKind::UpstreamUnavailable,
        };
        Some(Error::engine(kind, format!("upstream returned {status}")))
    }

    fn map_request_error(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::engine(ErrorKind::UpstreamTimeout, e.to_string())
        } else {
            Error::engine(ErrorKind::UpstreamUnavailable, e.to_string())
        }
    }
}

#[async_trait]
impl UpstreamClient for OpenWebIfClient {
    async fn stream_url(&self, service_ref: &str) -> Result<Url> {
        // OpenWebIF exposes direct transport streams on port 8001.
        let mut url = self.base.clone();
        url.set_port(Some(8001))
            .map_err(|_| Error::config("OpenWebIF URL does not allow a port"))?;
        url.set_path(service_ref);
        Ok(url)
    }

    async fn head(&self, url: &Url) -> Result<u16> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(Self::map_request_error)?;
        Ok(response.status().as_u16())
    }

    async fn delete_recording(&self, service_ref: &str) -> Result<()> {
        let mut url = self.base.clone();
        url.set_path("/api/movedelete");
        url.query_pairs_mut().append_pair("sRef", service_ref);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        if let Some(err) = Self::map_status(response.status()) {
            return Err(err);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut url = self.base.clone();
        url.set_path("/api/statusinfo");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_request_error)?;
        if let Some(err) = Self::map_status(response.status()) {
            return Err(err);
        }
        Ok(())
    }
}

/// Scriptable upstream for tests: URLs resolve against a fake host, HEAD
/// status and deletion outcomes are programmable.
#[derive(Default)]
pub struct MockUpstream {
    head_status: Mutex<HashMap<String, u16>>,
    deleted: Mutex<Vec<String>>,
    delete_error: Mutex<Option<ErrorKind>>,
    reachable: Mutex<bool>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            reachable: Mutex::new(true),
            ..Self::default()
        }
    }

    pub fn set_head_status(&self, url: &str, status: u16) {
        self.head_status.lock().insert(url.to_string(), status);
    }

    pub fn set_delete_error(&self, kind: Option<ErrorKind>) {
        *self.delete_error.lock() = kind;
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock() = reachable;
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn stream_url(&self, service_ref: &str) -> Result<Url> {
        Url::parse(&format!("http://upstream.test:8001/{service_ref}"))
            .map_err(|e| Error::invalid_id(e.to_string()))
    }

    async fn head(&self, url: &Url) -> Result<u16> {
        Ok(*self.head_status.lock().get(url.as_str()).unwrap_or(&200))
    }

    async fn delete_recording(&self, service_ref: &str) -> Result<()> {
        if let Some(kind) = *self.delete_error.lock() {
            return Err(Error::engine(kind, "mock upstream delete failure"));
        }
        self.deleted.lock().push(service_ref.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if *self.reachable.lock() {
            Ok(())
        } else {
            Err(Error::engine(
                ErrorKind::UpstreamUnavailable,
                "mock upstream unreachable",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_url_uses_streaming_port() {
        let client = OpenWebIfClient::new("http://box.local").unwrap();
        let url = client.stream_url("1:0:1:ABCD:1:1:C00000:0:0:0:").await.unwrap();
        assert_eq!(url.port(), Some(8001));
        assert!(url.path().contains("1:0:1:ABCD"));
    }

    #[test]
    fn status_mapping_preserves_the_delete_taxonomy() {
        let kind_of = |status: u16| {
            OpenWebIfClient::map_status(reqwest::StatusCode::from_u16(status).unwrap())
                .map(|e| e.kind())
        };
        assert_eq!(kind_of(200), None);
        assert_eq!(kind_of(403), Some(ErrorKind::UpstreamAuth));
        assert_eq!(kind_of(404), Some(ErrorKind::VodNotFound));
        assert_eq!(kind_of(500), Some(ErrorKind::InternalError));
        assert_eq!(kind_of(504), Some(ErrorKind::UpstreamTimeout));
        assert_eq!(kind_of(503), Some(ErrorKind::UpstreamUnavailable));
    }

    #[tokio::test]
    async fn mock_delete_records_refs_and_errors() {
        let mock = MockUpstream::new();
        mock.delete_recording("1:0:0:REC").await.unwrap();
        assert_eq!(mock.deleted(), vec!["1:0:0:REC".to_string()]);

        mock.set_delete_error(Some(ErrorKind::VodNotFound));
        let err = mock.delete_recording("1:0:0:REC").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VodNotFound);
    }
}
