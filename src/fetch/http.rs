//! HTTP resource fetcher
//!
//! Issues conditional GETs, honours `304 Not Modified`, caps the body size
//! and hands everything else to an object factory.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use super::{Download, ObjectFactory, ResourceFetcher, ResponseSource};
use crate::cache::Validators;
use crate::error::FetchError;

/// Default cap on downloaded bodies.
pub const DEFAULT_MAX_DOWNLOAD_SIZE: usize = 10 * 1024 * 1024; // 10 MB

// == Http Fetcher ==
/// Downloads URLs with a shared `reqwest` client.
pub struct HttpFetcher<T, O> {
    client: Client,
    factory: O,
    max_download_size: usize,
    _object: PhantomData<fn() -> T>,
}

impl<T, O> HttpFetcher<T, O>
where
    O: ObjectFactory<T>,
{
    // == Constructor ==
    /// Creates a fetcher that builds objects with `factory`.
    pub fn new(client: Client, factory: O) -> Self {
        Self {
            client,
            factory,
            max_download_size: DEFAULT_MAX_DOWNLOAD_SIZE,
            _object: PhantomData,
        }
    }

    // == With Max Download Size ==
    /// Sets the largest body, in bytes, that will be accepted.
    pub fn with_max_download_size(mut self, max_download_size: usize) -> Self {
        self.max_download_size = max_download_size;
        self
    }

    // == Max Download Size ==
    /// Returns the body size limit in bytes.
    pub fn max_download_size(&self) -> usize {
        self.max_download_size
    }

    // == Slurp ==
    /// Reads the whole body, failing as soon as it grows past the limit.
    async fn slurp(&self, url: &str, mut response: Response) -> Result<Vec<u8>, FetchError> {
        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_download_size,
        };

        let mut body = match response.content_length() {
            Some(len) if len > self.max_download_size as u64 => return Err(too_large()),
            Some(len) => Vec::with_capacity(len as usize),
            None => Vec::new(),
        };

        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_download_size {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl<T, O> ResourceFetcher<T> for HttpFetcher<T, O>
where
    T: Send + 'static,
    O: ObjectFactory<T>,
{
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
        last_poll_started: DateTime<Utc>,
    ) -> Result<Download<T>, FetchError> {
        let mut request = self.client.get(url);

        // The origin's own Last-Modified is trusted over our clock
        match &validators.last_modified {
            Some(last_modified) => {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
            None if last_poll_started > DateTime::<Utc>::UNIX_EPOCH => {
                request = request.header(IF_MODIFIED_SINCE, http_date(last_poll_started));
            }
            None => {}
        }
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let reported = Validators {
            last_modified: header_string(response.headers(), LAST_MODIFIED),
            etag: header_string(response.headers(), ETAG),
        };

        if status == StatusCode::NOT_MODIFIED {
            debug!("{} not modified since last poll", url);
            return Ok(Download::not_modified(Validators {
                last_modified: reported.last_modified.or_else(|| validators.last_modified.clone()),
                etag: reported.etag.or_else(|| validators.etag.clone()),
            }));
        }

        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = header_string(response.headers(), CONTENT_TYPE);
        let body = self.slurp(url, response).await?;
        debug!("Downloaded {} bytes from {}", body.len(), url);

        let source = ResponseSource::new(status.as_u16(), content_type, body);
        match self.factory.create(url, &source)? {
            Some(object) => Ok(Download::modified(object, reported)),
            None => Err(FetchError::Rejected {
                url: url.to_string(),
            }),
        }
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

/// Formats a timestamp as an RFC 7231 HTTP-date.
fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::TextFactory;

    #[test]
    fn test_http_date_format() {
        let time = DateTime::from_timestamp(784_111_777, 0).unwrap();
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_header_string_ignores_missing_and_opaque_values() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, "Sun, 06 Nov 1994 08:49:37 GMT".parse().unwrap());
        headers.insert(ETAG, reqwest::header::HeaderValue::from_bytes(b"\"\xff\"").unwrap());

        assert_eq!(
            header_string(&headers, LAST_MODIFIED).as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert_eq!(header_string(&headers, ETAG), None);
        assert_eq!(header_string(&headers, CONTENT_TYPE), None);
    }

    #[tokio::test]
    async fn test_default_download_limit() {
        let fetcher: HttpFetcher<String, _> = HttpFetcher::new(Client::new(), TextFactory);
        assert_eq!(fetcher.max_download_size(), DEFAULT_MAX_DOWNLOAD_SIZE);
        assert_eq!(fetcher.with_max_download_size(16).max_download_size(), 16);
    }
}
