//! Exchanges and the options they carry.
//!
//! An [`Exchange`] is one request/response attempt: the request, the options
//! in force, the resolved proxy chain, and slots for the outcome. The façade
//! builds one and hands it to [`Client::execute`](crate::Client::execute);
//! the transport only ever mutates the outcome slots (and the request while
//! following redirects).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::HeaderName;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    body::Body,
    cookie::CookieStore,
    dns::{AddrType, Resolve},
    error::{Error, Result},
    http2::Http2Fingerprint,
    quic::{QuicFingerprint, QuicOptions},
    response::Response,
    tls::{Ja3Fingerprint, TlsOptions},
};

/// Default budget for the TLS phase of a dial.
pub(crate) const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default budget between dispatching a task and receiving response headers.
pub(crate) const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(300);

/// Callback invoked before and after the round trip; may mutate the
/// exchange. Returning [`Error::use_last_response`] before the round trip
/// short-circuits it.
pub type RequestCallback = Arc<dyn Fn(&mut Exchange) -> Result<()> + Send + Sync>;

/// Callback invoked when a dial fails; returning an error makes the failure
/// terminal instead of retryable.
pub type ErrCallback = Arc<dyn Fn(&mut Exchange, &Error) -> Result<()> + Send + Sync>;

/// Proxy rotation hooks consulted when no explicit chain is configured.
pub type GetProxyFn = Arc<dyn Fn(&Exchange) -> Result<Option<String>> + Send + Sync>;
/// Like [`GetProxyFn`], returning a whole chain.
pub type GetProxiesFn = Arc<dyn Fn(&Exchange) -> Result<Vec<String>> + Send + Sync>;

/// Structured log callback.
pub type Logger = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// What a [`LogEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    DnsLookup,
    TcpConnect,
    ProxyTunnel,
    TlsHandshake,
    QuicHandshake,
    ResponseHeaders,
    Redirect,
}

/// One structured log event, tagged with the exchange's request id.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub id: u64,
    pub time: SystemTime,
    pub kind: LogKind,
    pub msg: String,
}

/// Options consumed by the transport core.
///
/// All fields have usable defaults; `Default::default()` is a working
/// configuration (direct connection, auto cookie jar, insecure TLS verify,
/// unlimited redirects).
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// TLS options for https targets and https proxy hops.
    pub tls: TlsOptions,
    /// ClientHello fingerprint; `None` dials with the stock hello.
    pub ja3: Option<Ja3Fingerprint>,
    /// HTTP/2 preface fingerprint.
    pub http2: Option<Http2Fingerprint>,
    /// QUIC options for HTTP/3 exchanges.
    pub quic: QuicOptions,
    /// QUIC transport-parameter fingerprint.
    pub uquic: Option<QuicFingerprint>,
    /// Speak HTTP/3 over QUIC.
    pub h3: bool,
    /// Restrict ALPN to http/1.1.
    pub force_http1: bool,
    /// Wire order of request headers; unlisted headers keep insertion order.
    pub order_headers: Option<Vec<HeaderName>>,

    /// Single proxy URL.
    pub proxy: Option<String>,
    /// Full proxy chain, dialed in order.
    pub proxies: Vec<String>,
    /// Disable proxying even if a proxy is configured.
    pub dis_proxy: bool,
    /// Rotation hook for a single proxy.
    pub get_proxy: Option<GetProxyFn>,
    /// Rotation hook for a chain.
    pub get_proxies: Option<GetProxiesFn>,

    /// Budget for the TLS phase of a dial. Defaults to 10 s.
    pub tls_handshake_timeout: Option<Duration>,
    /// Budget from task dispatch to response headers. Defaults to 300 s.
    pub response_header_timeout: Option<Duration>,

    /// Pre/post round-trip hook.
    pub request_callback: Option<RequestCallback>,
    /// Dial-failure hook.
    pub err_callback: Option<ErrCallback>,
    /// Structured log events.
    pub logger: Option<Logger>,

    /// Cookie store; auto-created unless `dis_cookie`.
    pub jar: Option<Arc<dyn CookieStore>>,
    /// Disable cookie handling entirely.
    pub dis_cookie: bool,
    /// Negative disables redirects, `0` means unlimited, positive caps them.
    pub max_redirect: i32,

    /// Address family preference for DNS results.
    pub addr_type: Option<AddrType>,
    /// Custom DNS resolver.
    pub resolver: Option<Arc<dyn Resolve>>,
}

impl RequestOptions {
    pub(crate) fn tls_handshake_timeout(&self) -> Duration {
        self.tls_handshake_timeout
            .unwrap_or(DEFAULT_TLS_HANDSHAKE_TIMEOUT)
    }

    pub(crate) fn response_header_timeout(&self) -> Duration {
        self.response_header_timeout
            .unwrap_or(DEFAULT_RESPONSE_HEADER_TIMEOUT)
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("h3", &self.h3)
            .field("force_http1", &self.force_http1)
            .field("proxy", &self.proxy)
            .field("proxies", &self.proxies)
            .field("dis_proxy", &self.dis_proxy)
            .field("dis_cookie", &self.dis_cookie)
            .field("max_redirect", &self.max_redirect)
            .finish()
    }
}

/// One request/response attempt moving through the transport.
pub struct Exchange {
    pub(crate) request: http::Request<Body>,
    pub(crate) url: Url,
    pub(crate) options: RequestOptions,
    pub(crate) proxies: Vec<Url>,
    pub(crate) request_id: u64,
    pub(crate) response: Option<Response>,
    pub(crate) is_new_conn: bool,
    pub(crate) body_consumed: bool,
    pub(crate) token: CancellationToken,
}

impl Exchange {
    /// Build an exchange around a request. The request URI must be absolute
    /// with an http or https scheme.
    pub fn new(request: http::Request<Body>, options: RequestOptions) -> Result<Exchange> {
        let url = Url::parse(&request.uri().to_string()).map_err(Error::builder)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::builder(format!("unsupported request scheme {other:?}")));
            }
        }
        Ok(Exchange {
            request,
            url,
            options,
            proxies: Vec::new(),
            request_id: 0,
            response: None,
            is_new_conn: false,
            body_consumed: false,
            token: CancellationToken::new(),
        })
    }

    /// The request as it will be (or was last) sent.
    pub fn request(&self) -> &http::Request<Body> {
        &self.request
    }

    /// Mutable access for callbacks.
    pub fn request_mut(&mut self) -> &mut http::Request<Body> {
        &mut self.request
    }

    /// The current request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The options in force.
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Mutable access for callbacks.
    pub fn options_mut(&mut self) -> &mut RequestOptions {
        &mut self.options
    }

    /// The proxy chain this exchange will dial through.
    pub fn proxies(&self) -> &[Url] {
        &self.proxies
    }

    /// Replace the proxy chain. Each URL is validated.
    pub fn set_proxies(&mut self, proxies: Vec<Url>) -> Result<()> {
        for p in &proxies {
            crate::address::Address::from_url(p)?;
        }
        self.proxies = proxies;
        Ok(())
    }

    /// The response slot.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Mutable access to the response slot.
    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// Take the response out of the exchange.
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    /// Whether the last round trip dialed a fresh connection.
    pub fn is_new_conn(&self) -> bool {
        self.is_new_conn
    }

    /// The exchange's id, assigned by the client, surfaced in log events.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// A token cancelling this exchange when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a transport retry may replay the request body.
    pub(crate) fn supports_retry(&self) -> bool {
        self.request.body().is_reusable() || !self.body_consumed
    }

    /// Produce the engine-ready request for one attempt, or `None` when the
    /// body was a stream that has already been consumed.
    pub(crate) fn engine_request(&mut self) -> Option<http::Request<hyper::Body>> {
        let body = match self.request.body().try_clone() {
            Some(clone) => clone,
            None => {
                if self.body_consumed {
                    return None;
                }
                self.body_consumed = true;
                std::mem::take(self.request.body_mut())
            }
        };

        let content_length = body.content_length().filter(|len| *len > 0);
        let mut request = http::Request::new(body.into_hyper());
        *request.method_mut() = self.request.method().clone();
        *request.uri_mut() = self.request.uri().clone();
        for (name, value) in self.request.headers() {
            request.headers_mut().append(name.clone(), value.clone());
        }
        // The HTTP/3 engine frames the body itself and never sees hyper's
        // length inference, so pin the length here for every engine.
        if let Some(len) = content_length {
            if !request.headers().contains_key(http::header::CONTENT_LENGTH) {
                request
                    .headers_mut()
                    .insert(http::header::CONTENT_LENGTH, http::HeaderValue::from(len));
            }
        }
        Some(request)
    }

    pub(crate) fn log(&self, kind: LogKind, msg: impl Into<String>) {
        if let Some(ref logger) = self.options.logger {
            logger(LogEvent {
                id: self.request_id,
                time: SystemTime::now(),
                kind,
                msg: msg.into(),
            });
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", self.request.method())
            .field("url", &self.url.as_str())
            .field("request_id", &self.request_id)
            .field("is_new_conn", &self.is_new_conn)
            .finish()
    }
}
