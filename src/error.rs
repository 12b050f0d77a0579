use std::{error::Error as StdError, fmt, io};

use url::Url;

/// A `Result` alias where the `Err` case is `wirereq::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while driving an exchange.
///
/// Note: errors may include the full URL used to make the request. If the URL
/// contains sensitive information (e.g. an API key as a query parameter), be
/// sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn invalid_proxy<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::InvalidProxy, Some(e))
    }

    pub(crate) fn dns<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Dns, Some(e))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::TlsHandshake, Some(e))
    }

    pub(crate) fn quic<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::QuicHandshake, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, url: Url) -> Error {
        Error::new(Kind::Redirect, Some(e)).with_url(url)
    }

    pub(crate) fn callback<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Callback, Some(e))
    }

    pub(crate) fn header_timeout() -> Error {
        Error::new(Kind::HeaderTimeout, None::<Error>)
    }

    pub(crate) fn cancelled() -> Error {
        Error::new(Kind::Cancelled, None::<Error>)
    }

    pub(crate) fn client_closed() -> Error {
        Error::new(Kind::ClientClosed, None::<Error>)
    }

    pub(crate) fn retry_exhausted(tries: usize, source: Option<Error>) -> Error {
        match source {
            Some(source) => Error::new(Kind::RetryExhausted, Some(source)),
            None => Error::new(
                Kind::RetryExhausted,
                Some(format!("gave up after {tries} attempts")),
            ),
        }
    }

    /// The sentinel a request callback returns to short-circuit the round
    /// trip and keep the exchange's current response.
    pub fn use_last_response() -> Error {
        Error::new(Kind::UseLastResponse, None::<Error>)
    }

    /// An error for aborting an exchange from a request or error callback.
    pub fn aborted<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Callback, Some(e))
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Add a URL related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related URL from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns true if the error came from an invalid proxy configuration.
    pub fn is_invalid_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidProxy)
    }

    /// Returns true if the error is related to establishing a connection:
    /// DNS, TCP dial, proxy tunnel, or a TLS/QUIC handshake.
    pub fn is_connect(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Dns | Kind::Connect | Kind::TlsHandshake | Kind::QuicHandshake
        )
    }

    /// Returns true if the error is related to a TLS handshake.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::TlsHandshake)
    }

    /// Returns true if the peer violated HTTP/1, HTTP/2 or HTTP/3 framing.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if response headers were not received within the budget.
    pub fn is_header_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::HeaderTimeout)
    }

    /// Returns true if the caller's cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }

    /// Returns true if a request or error callback aborted the exchange.
    pub fn is_callback(&self) -> bool {
        matches!(self.inner.kind, Kind::Callback)
    }

    /// Returns true if a redirect target could not be processed.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect)
    }

    /// Returns true if the transport retry budget was exceeded.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::RetryExhausted)
    }

    /// Returns true if the error is related to the request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if this is the [`use_last_response`](Error::use_last_response) sentinel.
    pub fn is_use_last_response(&self) -> bool {
        matches!(self.inner.kind, Kind::UseLastResponse)
    }

    /// Returns true for errors the transport retry loop may absorb.
    ///
    /// Transport-class errors kill the connector that produced them and are
    /// retried against a fresh connection; everything else surfaces to the
    /// caller immediately.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Dns | Kind::Connect | Kind::TlsHandshake | Kind::QuicHandshake | Kind::Protocol
        )
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if self.is_header_timeout() {
            return true;
        }
        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("wirereq::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", url);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::InvalidProxy => f.write_str("invalid proxy")?,
            Kind::Dns => f.write_str("dns resolution failed")?,
            Kind::Connect => f.write_str("connect failed")?,
            Kind::TlsHandshake => f.write_str("tls handshake failed")?,
            Kind::QuicHandshake => f.write_str("quic handshake failed")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::HeaderTimeout => f.write_str("timed out waiting for response headers")?,
            Kind::Cancelled => f.write_str("exchange cancelled")?,
            Kind::Callback => f.write_str("callback aborted exchange")?,
            Kind::Redirect => f.write_str("error following redirect")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::RetryExhausted => f.write_str("transport retries exhausted")?,
            Kind::ClientClosed => f.write_str("client is closed")?,
            Kind::UseLastResponse => f.write_str("use last response")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    InvalidProxy,
    Dns,
    Connect,
    TlsHandshake,
    QuicHandshake,
    Protocol,
    HeaderTimeout,
    Cancelled,
    Callback,
    Redirect,
    Body,
    RetryExhausted,
    ClientClosed,
    UseLastResponse,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Connect, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn transport_classification() {
        assert!(Error::connect("refused").is_transport());
        assert!(Error::dns("nxdomain").is_transport());
        assert!(Error::protocol("bad frame").is_transport());
        assert!(!Error::header_timeout().is_transport());
        assert!(!Error::cancelled().is_transport());
        assert!(!Error::callback("nope").is_transport());
    }

    #[test]
    fn is_timeout() {
        assert!(Error::header_timeout().is_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::connect(io);
        assert!(nested.is_timeout());
        assert!(!Error::connect("refused").is_timeout());
    }
}
