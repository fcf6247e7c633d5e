//! Response sources and object factories
//!
//! A `ResponseSource` is a fully read HTTP response; an `ObjectFactory` turns
//! one into the object the cache stores.

use crate::error::FetchError;

// == Response Source ==
/// A slurped response handed to an object factory.
#[derive(Debug, Clone)]
pub struct ResponseSource {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl ResponseSource {
    // == Constructor ==
    /// Wraps a response that has already been read in full.
    pub fn new(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    // == Status ==
    /// The HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    // == Content Type ==
    /// The raw `Content-Type` header, if the origin sent one.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    // == Charset ==
    /// The `charset` parameter of the content type, lowercased.
    pub fn charset(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        content_type.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("charset") {
                Some(value.trim().trim_matches('"').to_ascii_lowercase())
            } else {
                None
            }
        })
    }

    // == Bytes ==
    /// The raw body.
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    // == Text ==
    /// Decodes the body as text using the content type's charset.
    ///
    /// UTF-8 is assumed when no charset is given.
    pub fn text(&self) -> Result<String, FetchError> {
        match self.charset().as_deref() {
            None | Some("utf-8") | Some("utf8") | Some("us-ascii") => {
                String::from_utf8(self.body.clone())
                    .map_err(|e| FetchError::Parse(format!("body is not valid UTF-8: {}", e)))
            }
            Some("iso-8859-1") | Some("latin1") | Some("latin-1") => {
                Ok(self.body.iter().map(|&b| char::from(b)).collect())
            }
            Some(other) => Err(FetchError::Parse(format!(
                "unsupported charset '{}'",
                other
            ))),
        }
    }
}

// == Object Factory ==
/// Turns a response into a cacheable object.
///
/// `Ok(None)` means the response is not acceptable for caching; the cache
/// records that as a failed download.
pub trait ObjectFactory<T>: Send + Sync {
    fn create(&self, url: &str, source: &ResponseSource) -> Result<Option<T>, FetchError>;
}

impl<T, F> ObjectFactory<T> for F
where
    F: Fn(&str, &ResponseSource) -> Result<Option<T>, FetchError> + Send + Sync,
{
    fn create(&self, url: &str, source: &ResponseSource) -> Result<Option<T>, FetchError> {
        self(url, source)
    }
}

// == Text Factory ==
/// Caches successful responses as decoded text (schemas, policy fragments).
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFactory;

impl ObjectFactory<String> for TextFactory {
    fn create(&self, _url: &str, source: &ResponseSource) -> Result<Option<String>, FetchError> {
        if !(200..300).contains(&source.status()) {
            return Ok(None);
        }
        source.text().map(Some)
    }
}
