use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode, Url};
use tracing::debug;

use super::{Source, SourceDescriptor, SourceError, SourceStream};

/// Default timeout for HTTP connection.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for HTTP read operations.
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Reads origin content over HTTP(S).
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(crate::constants::USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Creates a source with a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn parse_url(raw: &str) -> Result<Url, SourceError> {
        let url = Url::parse(raw).map_err(|e| SourceError::InvalidUrl(format!("{raw}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(SourceError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// First byte and total length from a `Content-Range: bytes a-b/total`
/// header. Either part is `None` when given as `*`.
fn parse_content_range(value: &str) -> Option<(Option<u64>, Option<u64>)> {
    let (range, total) = value.trim().strip_prefix("bytes")?.rsplit_once('/')?;
    let first = range
        .split_once('-')
        .and_then(|(first, _)| first.trim().parse().ok());
    Some((first, total.trim().parse().ok()))
}

#[async_trait]
impl Source for HttpSource {
    async fn open_range(
        &self,
        source: &SourceDescriptor,
        start: u64,
    ) -> Result<SourceStream, SourceError> {
        let url = Self::parse_url(&source.url)?;

        let mut request = self.client.get(url);
        for (name, value) in &source.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if start > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", start));
        }

        debug!("Source: opening {} at byte {}", source.url, start);
        let response = request.send().await?;

        let (stream_start, supports_range, content_length) = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let (first, total) = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .unwrap_or((None, None));
                let first = first.unwrap_or(start);
                if first != start {
                    debug!(
                        "Source: {} answered range {}- with data from byte {}",
                        source.url, start, first
                    );
                }
                let total = total.or_else(|| response.content_length().map(|len| first + len));
                (first, true, total)
            }
            StatusCode::OK => {
                // Full body: either no range was asked for or the origin ignored it.
                let accepts = response
                    .headers()
                    .get(header::ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
                (0, accepts && start == 0, response.content_length())
            }
            StatusCode::RANGE_NOT_SATISFIABLE if start > 0 => {
                // nothing left past `start`; Content-Range is `bytes */total`
                let total = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .and_then(|(_, total)| total);
                if total != Some(start) {
                    return Err(SourceError::Status(StatusCode::RANGE_NOT_SATISFIABLE));
                }
                return Ok(SourceStream {
                    body: futures::stream::empty().boxed(),
                    start,
                    supports_range: true,
                    content_length: total,
                });
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                return Err(SourceError::TemporarilyBusy);
            }
            status => return Err(SourceError::Status(status)),
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SourceError::from))
            .boxed();

        Ok(SourceStream {
            body,
            start: stream_start,
            supports_range,
            content_length,
        })
    }
}
