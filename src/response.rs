//! The response half of an exchange.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::error::{Error, Result};

/// A server response: status line, headers, and a streaming body.
pub struct Response {
    inner: http::Response<hyper::Body>,
    url: Url,
}

impl Response {
    pub(crate) fn new(inner: http::Response<hyper::Body>, url: Url) -> Response {
        Response { inner, url }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    /// The HTTP version the exchange was carried over.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// The version rendered the way servers print it: `"HTTP/1.1"`,
    /// `"HTTP/2.0"`, `"HTTP/3.0"`.
    pub fn proto(&self) -> &'static str {
        match self.inner.version() {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/?",
        }
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// The final URL of this response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Collect the full response body.
    pub async fn bytes(self) -> Result<Bytes> {
        hyper::body::to_bytes(self.inner.into_body())
            .await
            .map_err(Error::body)
    }

    /// Collect the full response body as text (lossy UTF-8).
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Stream the next body chunk.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        use hyper::body::HttpBody;

        match self.inner.body_mut().data().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(Error::body(e)),
            None => Ok(None),
        }
    }

    /// Read the body to its end and discard it, releasing the connection
    /// for reuse.
    pub(crate) async fn drain(&mut self) -> Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .field("version", &self.version())
            .finish()
    }
}
