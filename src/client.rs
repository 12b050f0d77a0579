//! The client: cookie handling, redirect following, lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    address::verify_proxy,
    body::Body,
    cookie::{self, Jar},
    dns::DynResolver,
    error::{Error, Result},
    exchange::{Exchange, LogKind, RequestOptions},
    response::Response,
    sync::RwLock,
    transport::RoundTripper,
};

/// A connection-managing HTTP client.
///
/// Cheap to clone; clones share the connection pools. Dropping the last
/// clone does not close live connections: call [`Client::close`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    defaults: RwLock<RequestOptions>,
    transport: RoundTripper,
    token: CancellationToken,
    closed: AtomicBool,
    next_request_id: AtomicU64,
}

impl Client {
    /// Build a client. Configured proxies are validated here.
    pub fn new(options: RequestOptions) -> Result<Client> {
        Client::with_token(CancellationToken::new(), options)
    }

    /// Like [`Client::new`], with the client's cancellation scope parented
    /// to `parent`: cancelling it cancels every pool and connector.
    pub fn with_token(parent: CancellationToken, mut options: RequestOptions) -> Result<Client> {
        if let Some(ref proxy) = options.proxy {
            verify_proxy(proxy)?;
        }
        for proxy in &options.proxies {
            verify_proxy(proxy)?;
        }
        if options.jar.is_none() && !options.dis_cookie {
            options.jar = Some(Arc::new(Jar::default()));
        }
        let token = parent.child_token();
        let resolver = match options.resolver.clone() {
            Some(resolver) => DynResolver::new(resolver),
            None => DynResolver::gai(),
        };
        Ok(Client {
            inner: Arc::new(ClientRef {
                transport: RoundTripper::new(token.clone(), resolver),
                defaults: RwLock::new(options),
                token,
                closed: AtomicBool::new(false),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }

    /// Replace the client's proxy. The URL is validated before it is stored.
    pub fn set_proxy(&self, proxy: &str) -> Result<()> {
        verify_proxy(proxy)?;
        self.inner.defaults.write().proxy = Some(proxy.to_string());
        Ok(())
    }

    /// Replace the client's proxy chain. All URLs are validated before any
    /// is stored.
    pub fn set_proxies(&self, proxies: Vec<String>) -> Result<()> {
        for proxy in &proxies {
            verify_proxy(proxy)?;
        }
        self.inner.defaults.write().proxies = proxies;
        Ok(())
    }

    /// Drain idle and in-use connections: exchanges in flight finish first.
    pub fn close_conns(&self) {
        self.inner.transport.close_conns();
    }

    /// Kill every connection now, in use or not.
    pub fn force_close_conns(&self) {
        self.inner.transport.force_close_conns();
    }

    /// Close the client. New exchanges are rejected afterwards.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.force_close_conns();
        self.inner.token.cancel();
    }

    /// Whether [`Client::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Convenience: build an exchange from `request` with the client's
    /// default options, run it, and return the response.
    pub async fn send(&self, request: http::Request<Body>) -> Result<Response> {
        let options = self.inner.defaults.read().clone();
        let mut ex = Exchange::new(request, options)?;
        self.execute(&mut ex).await?;
        ex.take_response()
            .ok_or_else(|| Error::protocol("exchange completed without a response"))
    }

    /// Run an exchange: cookies, round trips, redirects. On success the
    /// response is in the exchange's response slot.
    pub async fn execute(&self, ex: &mut Exchange) -> Result<()> {
        if self.is_closed() {
            return Err(Error::client_closed());
        }
        ex.request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.prepare(ex)?;

        let client_token = self.inner.token.clone();
        tokio::select! {
            result = self.follow(ex) => result,
            _ = client_token.cancelled() => Err(Error::cancelled()),
        }
    }

    /// Fill exchange-level gaps from the client defaults and fold configured
    /// proxy URLs into the exchange's chain.
    fn prepare(&self, ex: &mut Exchange) -> Result<()> {
        let defaults = self.inner.defaults.read();
        if ex.options.jar.is_none() && !ex.options.dis_cookie {
            ex.options.jar = defaults.jar.clone();
        }
        if ex.proxies.is_empty() && !ex.options.dis_proxy {
            let configured: Vec<String> = if !ex.options.proxies.is_empty() {
                ex.options.proxies.clone()
            } else if let Some(ref proxy) = ex.options.proxy {
                vec![proxy.clone()]
            } else if !defaults.proxies.is_empty() {
                defaults.proxies.clone()
            } else if let Some(ref proxy) = defaults.proxy {
                vec![proxy.clone()]
            } else {
                Vec::new()
            };
            let mut chain = Vec::with_capacity(configured.len());
            for proxy in &configured {
                chain.push(verify_proxy(proxy)?);
            }
            ex.proxies = chain;
        }
        Ok(())
    }

    /// The redirect loop around [`Client::send_once`].
    async fn follow(&self, ex: &mut Exchange) -> Result<()> {
        let mut redirects = 0i32;
        loop {
            redirects += 1;
            self.send_once(ex).await?;

            let max_redirect = ex.options.max_redirect;
            if max_redirect < 0 {
                // redirects disabled: exactly one network exchange
                return Ok(());
            }
            if max_redirect > 0 && redirects > max_redirect {
                return Ok(());
            }

            let location = match ex
                .response
                .as_ref()
                .and_then(|r| r.headers().get(header::LOCATION))
            {
                Some(location) => location.clone(),
                None => return Ok(()),
            };
            let location = location
                .to_str()
                .map_err(|e| Error::redirect(e, ex.url.clone()))?
                .to_string();
            let next_url = ex
                .url
                .join(&location)
                .map_err(|e| Error::redirect(e, ex.url.clone()))?;

            let status = match ex.response.as_ref() {
                Some(response) => response.status(),
                None => return Ok(()),
            };
            let (method, should_redirect, include_body) =
                redirect_behavior(ex.request.method(), status);
            if !should_redirect {
                return Ok(());
            }
            ex.log(LogKind::Redirect, format!("{status} -> {next_url}"));

            // 307/308 replay the body when it is replayable; everything
            // else redirects without one.
            let body = if include_body {
                ex.request.body().try_clone().unwrap_or_default()
            } else {
                Body::empty()
            };

            let prev_url = ex.url.clone();
            let prev_headers = ex.request.headers().clone();

            let mut headers = default_headers();
            copy_matching_headers(&mut headers, &prev_headers);
            if !(prev_url.scheme() == "https" && next_url.scheme() == "http") {
                if let Ok(referer) = HeaderValue::from_str(prev_url.as_str()) {
                    headers.insert(header::REFERER, referer);
                }
            }

            if registrable_domain(&prev_url) == registrable_domain(&next_url) {
                if let Some(auth) = prev_headers.get(header::AUTHORIZATION) {
                    headers.insert(header::AUTHORIZATION, auth.clone());
                }
                let mut cookie_pairs: Vec<String> = prev_headers
                    .get_all(header::COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(str::to_string)
                    .collect();
                if let Some(response) = ex.response.as_ref() {
                    for set_cookie in
                        cookie::extract_response_cookie_headers(response.headers())
                    {
                        if let Ok(raw) = set_cookie.to_str() {
                            if let Some(pair) = raw.split(';').next() {
                                cookie_pairs.push(pair.trim().to_string());
                            }
                        }
                    }
                }
                if !cookie_pairs.is_empty() {
                    if let Ok(value) = HeaderValue::from_str(&cookie_pairs.join("; ")) {
                        headers.insert(header::COOKIE, value);
                    }
                }
            }

            let uri: http::Uri = next_url
                .as_str()
                .parse()
                .map_err(|e| Error::redirect(e, ex.url.clone()))?;
            let mut request = http::Request::new(body);
            *request.method_mut() = method;
            *request.uri_mut() = uri;
            *request.headers_mut() = headers;

            ex.request = request;
            ex.url = next_url;
            ex.body_consumed = false;

            // release the previous connection for reuse before looping
            if let Some(response) = ex.response.as_mut() {
                let _ = response.drain().await;
            }
        }
    }

    /// One network exchange: inject jar cookies, round trip, persist
    /// response cookies.
    async fn send_once(&self, ex: &mut Exchange) -> Result<()> {
        if !ex.options.dis_cookie {
            if let Some(jar) = ex.options.jar.clone() {
                if ex.request.headers().get(header::COOKIE).is_none() {
                    if let Some(values) = jar.cookies(&ex.url) {
                        let joined = values
                            .iter()
                            .filter_map(|v| v.to_str().ok())
                            .collect::<Vec<_>>()
                            .join("; ");
                        if let Ok(value) = HeaderValue::from_str(&joined) {
                            ex.request.headers_mut().insert(header::COOKIE, value);
                        }
                    }
                }
            }
        }

        self.inner.transport.round_trip(ex).await?;

        if !ex.options.dis_cookie {
            if let (Some(jar), Some(response)) = (ex.options.jar.clone(), ex.response.as_ref()) {
                let mut cookies =
                    cookie::extract_response_cookie_headers(response.headers()).peekable();
                if cookies.peek().is_some() {
                    jar.set_cookies(&mut cookies, &ex.url);
                }
            }
        }
        if let Some(response) = ex.response.as_mut() {
            *response.url_mut() = ex.url.clone();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// RFC 7231/7538 method preservation: 301/302/303 rewrite non-GET/HEAD to
/// GET and drop the body, 307/308 preserve both, anything else is not a
/// redirect.
fn redirect_behavior(method: &Method, status: StatusCode) -> (Method, bool, bool) {
    match status.as_u16() {
        301 | 302 | 303 => {
            let method = if *method != Method::GET && *method != Method::HEAD {
                Method::GET
            } else {
                method.clone()
            };
            (method, true, false)
        }
        307 | 308 => (method.clone(), true, true),
        _ => (method.clone(), false, false),
    }
}

/// The header set a fresh redirect request starts from.
fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!("wirereq/", env!("CARGO_PKG_VERSION"))),
    );
    headers
}

/// For names present in the default set, prefer the value the previous
/// request carried.
fn copy_matching_headers(headers: &mut HeaderMap, prev: &HeaderMap) {
    let names: Vec<HeaderName> = headers.keys().cloned().collect();
    for name in names {
        if let Some(value) = prev.get(&name) {
            headers.insert(name, value.clone());
        }
    }
}

/// The comparison scope for carrying credentials across redirects: the last
/// two DNS labels. IP literals and single-label hosts compare exactly.
fn registrable_domain(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Some(host.to_string());
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return Some(labels.join("."));
    }
    Some(labels[labels.len() - 2..].join("."))
}
