//! HTTP Cookies
//!
//! The transport core only ever talks to the two-method [`CookieStore`]
//! trait: read the `Cookie` values for a URL before sending, persist the
//! `Set-Cookie` values after receiving. [`Jar`] is the default in-memory
//! implementation, auto-installed unless cookies are disabled.

use std::convert::TryInto;
use std::fmt;
use std::time::SystemTime;

use bytes::BufMut;
use http::{header::SET_COOKIE, HeaderValue};

use crate::sync::RwLock;

/// Actions for a persistent cookie store providing session support.
pub trait CookieStore: Send + Sync {
    /// Store a set of Set-Cookie header values received from `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url);

    /// Get any Cookie values in the store for `url`.
    fn cookies(&self, url: &url::Url) -> Option<Vec<HeaderValue>>;
}

/// A single HTTP cookie.
pub struct Cookie<'a>(cookie_crate::Cookie<'a>);

impl<'a> Cookie<'a> {
    fn parse(value: &'a HeaderValue) -> Result<Cookie<'a>, CookieParseError> {
        std::str::from_utf8(value.as_bytes())
            .map_err(cookie_crate::ParseError::from)
            .and_then(cookie_crate::Cookie::parse)
            .map_err(CookieParseError)
            .map(Cookie)
    }

    /// The name of the cookie.
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The value of the cookie.
    pub fn value(&self) -> &str {
        self.0.value()
    }

    /// Returns true if the 'HttpOnly' directive is enabled.
    pub fn http_only(&self) -> bool {
        self.0.http_only().unwrap_or(false)
    }

    /// Returns true if the 'Secure' directive is enabled.
    pub fn secure(&self) -> bool {
        self.0.secure().unwrap_or(false)
    }

    /// Returns the path directive of the cookie, if set.
    pub fn path(&self) -> Option<&str> {
        self.0.path()
    }

    /// Returns the domain directive of the cookie, if set.
    pub fn domain(&self) -> Option<&str> {
        self.0.domain()
    }

    /// Get the Max-Age information.
    pub fn max_age(&self) -> Option<std::time::Duration> {
        self.0.max_age().and_then(|d| d.try_into().ok())
    }

    /// The cookie expiration time.
    pub fn expires(&self) -> Option<SystemTime> {
        match self.0.expires() {
            Some(cookie_crate::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
            None | Some(cookie_crate::Expiration::Session) => None,
        }
    }
}

impl fmt::Debug for Cookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) fn extract_response_cookie_headers(
    headers: &http::HeaderMap,
) -> impl Iterator<Item = &'_ HeaderValue> {
    headers.get_all(SET_COOKIE).iter()
}

/// Error representing a parse failure of a 'Set-Cookie' header.
pub(crate) struct CookieParseError(cookie_crate::ParseError);

impl fmt::Debug for CookieParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for CookieParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for CookieParseError {}

/// A good default `CookieStore` implementation.
///
/// This is the store the client installs when cookies are enabled and no
/// custom jar was supplied. It can be created and pre-filled before the
/// client exists.
pub struct Jar(RwLock<cookie_store::CookieStore>);

impl Jar {
    /// Add a cookie string to this jar, scoped to `url`.
    pub fn add_cookie_str(&self, cookie: &str, url: &url::Url) {
        let cookies = cookie_crate::Cookie::parse(cookie)
            .ok()
            .map(|c| c.into_owned())
            .into_iter();
        self.0.write().store_response_cookies(cookies, url);
    }

    /// Clear the contents of the jar.
    pub fn clear(&self) {
        self.0.write().clear();
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url) {
        let iter =
            cookie_headers.filter_map(|val| Cookie::parse(val).map(|c| c.0.into_owned()).ok());

        self.0.write().store_response_cookies(iter, url);
    }

    fn cookies(&self, url: &url::Url) -> Option<Vec<HeaderValue>> {
        let mut cookies = Vec::new();
        let lock = self.0.read();
        for (name, value) in lock.get_request_values(url) {
            let mut cookie = bytes::BytesMut::with_capacity(64);
            cookie.put(name.as_bytes());
            cookie.put(&b"="[..]);
            cookie.put(value.as_bytes());
            if let Ok(cookie) = HeaderValue::from_maybe_shared(cookie) {
                cookies.push(cookie);
            }
        }

        if cookies.is_empty() {
            None
        } else {
            Some(cookies)
        }
    }
}

impl Default for Jar {
    fn default() -> Self {
        Self(RwLock::new(cookie_store::CookieStore::default()))
    }
}

impl fmt::Debug for Jar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Jar").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jar_round_trips_cookies() {
        let url = url::Url::parse("https://example.com/").unwrap();
        let jar = Jar::default();
        assert!(jar.cookies(&url).is_none());

        jar.add_cookie_str("session=abc123", &url);
        let values = jar.cookies(&url).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].to_str().unwrap(), "session=abc123");

        // different host sees nothing
        let other = url::Url::parse("https://other.com/").unwrap();
        assert!(jar.cookies(&other).is_none());
    }

    #[test]
    fn jar_stores_set_cookie_headers() {
        let url = url::Url::parse("https://example.com/").unwrap();
        let jar = Jar::default();
        let mut headers = http::HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2; Path=/"));

        let mut iter = extract_response_cookie_headers(&headers);
        jar.set_cookies(&mut iter, &url);

        let values = jar.cookies(&url).unwrap();
        assert_eq!(values.len(), 2);
    }
}
