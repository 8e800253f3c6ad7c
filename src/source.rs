//! Upstream content access.
//!
//! A [`Source`] opens a byte stream for a [`SourceDescriptor`] starting at a
//! byte offset. Sources that honor range requests let the fetcher resume a
//! broken transfer at the last persisted piece boundary; others restart from
//! the beginning and the fetcher skips what it already holds.
//!
//! - [`HttpSource`] - HTTP(S) origin via `reqwest`, using `Range` headers

mod error;
mod http;

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

pub use error::SourceError;
pub use http::{HttpSource, HTTP_CONNECT_TIMEOUT, HTTP_READ_TIMEOUT};

/// A boxed stream of content chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SourceError>> + Send>>;

/// Where a task's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    /// Extra request headers forwarded to the origin.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Expected SHA-256 of the whole content, as `sha256:<hex>` or bare hex.
    #[serde(default)]
    pub digest: Option<String>,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            digest: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// The expected SHA-256 as lowercase hex, without any algorithm prefix.
    pub fn expected_sha256(&self) -> Option<String> {
        let digest = self.digest.as_deref()?.trim();
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        if hex.is_empty() {
            None
        } else {
            Some(hex.to_ascii_lowercase())
        }
    }
}

/// An open byte stream from a source.
pub struct SourceStream {
    pub body: ByteStream,
    /// Offset of the first byte of `body` within the content. Zero when the
    /// source ignored the requested start.
    pub start: u64,
    pub supports_range: bool,
    /// Total content length, when the source reports it.
    pub content_length: Option<u64>,
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Opens the content described by `source` at byte `start`.
    async fn open_range(
        &self,
        source: &SourceDescriptor,
        start: u64,
    ) -> Result<SourceStream, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_sha256() {
        let source = SourceDescriptor::new("http://a").with_digest("sha256:ABCD");
        assert_eq!(source.expected_sha256().as_deref(), Some("abcd"));

        let source = SourceDescriptor::new("http://a").with_digest("ff00");
        assert_eq!(source.expected_sha256().as_deref(), Some("ff00"));

        assert_eq!(SourceDescriptor::new("http://a").expected_sha256(), None);
    }
}
