//! Request bodies.

use std::fmt;

use bytes::Bytes;

/// A request body.
///
/// A body is either *reusable* (buffered bytes that can be replayed for a
/// transport retry or a 307/308 redirect) or *streaming* (consumed once).
/// Only exchanges whose body is absent or reusable are retry-eligible.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(hyper::Body),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body {
            inner: Inner::Reusable(Bytes::new()),
        }
    }

    /// Wrap a futures `Stream` in a box inside `Body`.
    ///
    /// A stream body cannot be replayed: a transport retry after it has been
    /// handed to an engine fails, and 307/308 redirects drop it.
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_core::stream::TryStream + Send + Sync + 'static,
        S::Error: Into<crate::error::BoxError>,
        Bytes: From<S::Ok>,
    {
        use futures_util::TryStreamExt;

        let body = hyper::Body::wrap_stream(stream.map_ok(Bytes::from).map_err(Into::into));
        Body {
            inner: Inner::Streaming(body),
        }
    }

    /// Returns the body bytes if it is reusable.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(bytes.as_ref()),
            Inner::Streaming(_) => None,
        }
    }

    /// Attempt to clone the body for replay; `None` for streaming bodies.
    pub fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(Body {
                inner: Inner::Reusable(bytes.clone()),
            }),
            Inner::Streaming(_) => None,
        }
    }

    pub(crate) fn is_reusable(&self) -> bool {
        matches!(self.inner, Inner::Reusable(_))
    }

    pub(crate) fn into_hyper(self) -> hyper::Body {
        match self.inner {
            Inner::Reusable(bytes) if bytes.is_empty() => hyper::Body::empty(),
            Inner::Reusable(bytes) => hyper::Body::from(bytes),
            Inner::Streaming(body) => body,
        }
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(bytes.len() as u64),
            Inner::Streaming(_) => None,
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body {
            inner: Inner::Reusable(vec.into()),
        }
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Body {
        Body {
            inner: Inner::Reusable(Bytes::from_static(s)),
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body {
            inner: Inner::Reusable(s.into()),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        s.as_bytes().into()
    }
}

impl From<hyper::Body> for Body {
    fn from(body: hyper::Body) -> Body {
        Body {
            inner: Inner::Streaming(body),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Inner::Reusable(ref bytes) => f.debug_struct("Body").field("len", &bytes.len()).finish(),
            Inner::Streaming(_) => f.debug_struct("Body").field("stream", &true).finish(),
        }
    }
}
