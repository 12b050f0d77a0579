//! The round tripper: pool selection, dial-on-miss, retry.
//!
//! One exchange flows through here as a loop: find the pool for the
//! exchange's `(proxy chain, target)` key and hand the task to an idle
//! connector; when none exists, dial a fresh connector, attach it, and try
//! again. Transport failures kill the connector that produced them and are
//! absorbed by the retry budget; everything else surfaces immediately.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    address::{pool_key, verify_proxy, Address, Scheme},
    connect::{socks, BoxStream, Dialer},
    dns::DynResolver,
    error::{Error, Result, TimedOut},
    exchange::{Exchange, LogKind},
    pool::{ConnPool, ConnPools, ReqTask, TaskReply},
    proto::{self, Connector, ProtoConn},
    quic,
    response::Response,
    tls::AlpnProtos,
};

/// Process-wide ceiling of transport retries per exchange.
pub(crate) const MAX_RETRY_COUNT: usize = 3;

/// Outcome of one iteration of the round-trip loop.
enum Attempt {
    /// The exchange completed (successfully or terminally).
    Handled(Result<Response>),
    /// Not completed; the optional transport error counts toward the retry
    /// budget and every pass through here consumes one attempt.
    Retry(Option<Error>),
}

pub(crate) struct RoundTripper {
    pools: Arc<ConnPools>,
    dialer: Dialer,
    token: CancellationToken,
}

impl RoundTripper {
    pub(crate) fn new(token: CancellationToken, resolver: DynResolver) -> RoundTripper {
        RoundTripper {
            pools: ConnPools::new(token.clone()),
            dialer: Dialer::new(resolver),
            token,
        }
    }

    /// Drain all pools, letting in-flight exchanges finish.
    pub(crate) fn close_conns(&self) {
        self.pools.safe_close_all();
    }

    /// Kill all pools now.
    pub(crate) fn force_close_conns(&self) {
        self.pools.force_close_all();
    }

    pub(crate) async fn round_trip(&self, ex: &mut Exchange) -> Result<()> {
        if let Some(callback) = ex.options.request_callback.clone() {
            match callback(ex) {
                Ok(()) => {}
                Err(err) if err.is_use_last_response() => {
                    return if ex.response.is_some() {
                        Ok(())
                    } else {
                        Err(Error::callback("use_last_response with no stored response"))
                    };
                }
                Err(err) => return Err(err),
            }
        }

        // Callbacks may have rewritten the request or options: resolve the
        // chain and key only now.
        let proxies = self.init_proxies(ex)?;
        let target = Address::from_url(&ex.url)?;
        let key = pool_key(&proxies, &target);
        log::trace!("round trip for pool key {key}");

        let mut pending: Option<http::Request<hyper::Body>> = None;
        let mut retry = 0usize;
        let mut last_err: Option<Error> = None;

        let result: Result<Response> = loop {
            if ex.token.is_cancelled() || self.token.is_cancelled() {
                break Err(Error::cancelled());
            }
            if retry >= MAX_RETRY_COUNT {
                break Err(Error::retry_exhausted(retry, last_err.take()));
            }

            let attempt = match self.pools.get(&key) {
                Some(pool) => {
                    let request = match pending.take().or_else(|| ex.engine_request()) {
                        Some(request) => request,
                        None => {
                            // a one-shot body was consumed by a failed
                            // attempt; surface what killed that attempt
                            break Err(last_err.take().unwrap_or_else(|| {
                                Error::body("request body is consumed and cannot be replayed")
                            }));
                        }
                    };
                    self.pool_round_trip(ex, &pool, request, &mut pending, &key, &proxies, &target)
                        .await
                }
                None => self.create_pool(ex, &key, &proxies, &target).await,
            };

            match attempt {
                Attempt::Handled(result) => break result,
                Attempt::Retry(err) => {
                    if let Some(err) = err {
                        if pending.is_none() && !ex.supports_retry() {
                            break Err(err);
                        }
                        last_err = Some(err);
                    }
                    retry += 1;
                }
            }
        };

        let response = result?;
        ex.response = Some(response);
        if let Some(callback) = ex.options.request_callback.clone() {
            callback(ex)?;
        }
        Ok(())
    }

    /// Dispatch `request` into `pool`, or grow the pool when no connector is
    /// idle.
    #[allow(clippy::too_many_arguments)]
    async fn pool_round_trip(
        &self,
        ex: &mut Exchange,
        pool: &Arc<ConnPool>,
        request: http::Request<hyper::Body>,
        pending: &mut Option<http::Request<hyper::Body>>,
        key: &str,
        proxies: &[Address],
        target: &Address,
    ) -> Attempt {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = ReqTask {
            request,
            order: ex.options.order_headers.clone(),
            reply: reply_tx,
        };

        let task = match pool.try_dispatch(task) {
            Ok(()) => {
                let budget = ex.options.response_header_timeout();
                return tokio::select! {
                    _ = ex.token.cancelled() => Attempt::Handled(Err(Error::cancelled())),
                    reply = tokio::time::timeout(budget, reply_rx) => match reply {
                        Err(_elapsed) => Attempt::Handled(Err(Error::header_timeout())),
                        Ok(Ok(TaskReply::Served(Ok(response)))) => {
                            ex.log(
                                LogKind::ResponseHeaders,
                                format!("status {}", response.status()),
                            );
                            Attempt::Handled(Ok(Response::new(response, ex.url.clone())))
                        }
                        Ok(Ok(TaskReply::Served(Err(err)))) => {
                            if err.is_transport() {
                                Attempt::Retry(Some(err))
                            } else {
                                Attempt::Handled(Err(err))
                            }
                        }
                        Ok(Ok(TaskReply::NotServed(request))) => {
                            // the receiving dispatcher was already dying
                            *pending = Some(request);
                            Attempt::Retry(None)
                        }
                        // the task was dropped with its dispatcher
                        Ok(Err(_closed)) => Attempt::Retry(None),
                    },
                };
            }
            Err(task) => task,
        };

        // No idle connector: grow the pool by one connector and have the
        // outer loop dispatch again.
        *pending = Some(task.request);
        self.create_pool(ex, key, proxies, target).await
    }

    /// Dial a fresh connector for `key` and attach it. The task is *not*
    /// served on it directly; the next loop iteration dispatches.
    async fn create_pool(
        &self,
        ex: &mut Exchange,
        key: &str,
        proxies: &[Address],
        target: &Address,
    ) -> Attempt {
        ex.is_new_conn = true;
        match self.dial(ex, proxies, target).await {
            Ok(conn) => {
                self.pools.attach(key, conn).await;
                Attempt::Retry(None)
            }
            Err(err) => {
                if let Some(callback) = ex.options.err_callback.clone() {
                    if let Err(abort) = callback(ex, &err) {
                        return Attempt::Handled(Err(abort));
                    }
                }
                if err.is_transport() {
                    Attempt::Retry(Some(err))
                } else {
                    // malformed proxies, cancellations and the like do not
                    // improve on a redial
                    Attempt::Handled(Err(err))
                }
            }
        }
    }

    /// Resolve the effective proxy chain, first non-empty source wins:
    /// explicit chain on the exchange, then the rotation callbacks.
    fn init_proxies(&self, ex: &Exchange) -> Result<Vec<Address>> {
        if ex.options.dis_proxy {
            return Ok(Vec::new());
        }
        if !ex.proxies.is_empty() {
            return ex.proxies.iter().map(Address::from_url).collect();
        }
        if let Some(get_proxy) = &ex.options.get_proxy {
            if let Some(proxy) = get_proxy(ex)? {
                let url = verify_proxy(&proxy)?;
                return Ok(vec![Address::from_url(&url)?]);
            }
        }
        if let Some(get_proxies) = &ex.options.get_proxies {
            let urls = get_proxies(ex)?;
            if !urls.is_empty() {
                return urls
                    .iter()
                    .map(|s| verify_proxy(s).and_then(|url| Address::from_url(&url)))
                    .collect();
            }
        }
        Ok(Vec::new())
    }

    async fn dial(&self, ex: &Exchange, proxies: &[Address], target: &Address) -> Result<Connector> {
        if ex.options.h3 {
            return self.dial_h3(ex, proxies, target).await;
        }

        let stream: BoxStream = if proxies.is_empty() {
            Box::new(self.dialer.dial(ex, target).await?)
        } else {
            self.dialer
                .dial_proxy_chain(ex, &ex.options.tls, proxies, target)
                .await?
        };

        let (stream, h2) = if target.scheme == Scheme::Https {
            let alpn = if ex.options.force_http1 {
                AlpnProtos::Http1
            } else {
                AlpnProtos::All
            };
            self.dialer
                .upgrade_tls(
                    ex,
                    stream,
                    &target.host,
                    &ex.options.tls,
                    ex.options.ja3.as_ref(),
                    alpn,
                )
                .await?
        } else {
            (stream, false)
        };

        let force = self.token.child_token();
        let proto = proto::attach_hyper(stream, h2, ex.options.http2.as_ref(), &force).await?;
        let mut conn = Connector::new(proto, proxies.to_vec(), force);
        if h2 {
            conn.h2_order = ex
                .options
                .http2
                .as_ref()
                .and_then(|fp| fp.order_headers.clone());
        }
        Ok(conn)
    }

    async fn dial_h3(
        &self,
        ex: &Exchange,
        proxies: &[Address],
        target: &Address,
    ) -> Result<Connector> {
        let remote = *self
            .dialer
            .lookup(ex, target)
            .await?
            .first()
            .ok_or_else(|| Error::dns(format!("no address for {}", target.host)))?;
        let client_config = quic::client_config(&ex.options.quic, ex.options.uquic.as_ref())?;

        let endpoint = if proxies.is_empty() {
            let local: SocketAddr = if remote.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = std::net::UdpSocket::bind(local).map_err(Error::connect)?;
            quinn::Endpoint::new(
                quinn::EndpointConfig::default(),
                None,
                socket,
                Arc::new(quinn::TokioRuntime),
            )
            .map_err(Error::connect)?
        } else {
            let last = &proxies[proxies.len() - 1];
            if last.scheme != Scheme::Socks5 {
                return Err(Error::invalid_proxy(
                    "http3 requires the last proxy hop to be socks5",
                ));
            }
            if proxies.len() > 1 {
                return Err(Error::invalid_proxy(
                    "http3 proxy chains longer than one hop are unsupported",
                ));
            }
            let control = self.dialer.dial(ex, last).await?;
            let socket = socks::relay_socket(last, control, remote).await?;
            ex.log(
                LogKind::ProxyTunnel,
                format!("{} udp associate for {}", last.authority(), target.authority()),
            );
            quinn::Endpoint::new_with_abstract_socket(
                quinn::EndpointConfig::default(),
                None,
                socket,
                Arc::new(quinn::TokioRuntime),
            )
            .map_err(Error::connect)?
        };

        let connecting = endpoint
            .connect_with(client_config, remote, &target.host)
            .map_err(Error::quic)?;
        let budget = ex.options.tls_handshake_timeout();
        let session = match tokio::time::timeout(budget, connecting).await {
            Ok(session) => session.map_err(Error::quic)?,
            Err(_) => return Err(Error::quic(TimedOut)),
        };
        ex.log(LogKind::QuicHandshake, format!("host:{}", target.host));

        let force = self.token.child_token();
        let proto = ProtoConn::H3(proto::h3::attach_h3(session, &force).await?);
        Ok(Connector::new(proto, proxies.to_vec(), force))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::exchange::RequestOptions;

    fn exchange(url: &str) -> Exchange {
        let req = http::Request::builder()
            .uri(url)
            .body(Body::empty())
            .unwrap();
        Exchange::new(req, RequestOptions::default()).unwrap()
    }

    fn transport() -> RoundTripper {
        RoundTripper::new(CancellationToken::new(), DynResolver::gai())
    }

    #[test]
    fn init_proxies_priority() {
        let rt = transport();

        // dis_proxy beats everything
        let mut ex = exchange("https://example.com/");
        ex.options_mut().dis_proxy = true;
        ex.set_proxies(vec![url::Url::parse("http://p1:3128").unwrap()])
            .unwrap();
        assert!(rt.init_proxies(&ex).unwrap().is_empty());

        // explicit chain beats the rotation callback
        let mut ex = exchange("https://example.com/");
        ex.set_proxies(vec![url::Url::parse("http://p1:3128").unwrap()])
            .unwrap();
        ex.options_mut().get_proxy = Some(Arc::new(|_: &Exchange| {
            Ok(Some("socks5://never:1080".to_string()))
        }));
        let chain = rt.init_proxies(&ex).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].authority(), "p1:3128");

        // rotation callback used when nothing else is set
        let mut ex = exchange("https://example.com/");
        ex.options_mut().get_proxy = Some(Arc::new(|_: &Exchange| {
            Ok(Some("socks5://rotated:1080".to_string()))
        }));
        let chain = rt.init_proxies(&ex).unwrap();
        assert_eq!(chain[0].scheme, Scheme::Socks5);

        // invalid proxy from the callback surfaces
        let mut ex = exchange("https://example.com/");
        ex.options_mut().get_proxy =
            Some(Arc::new(|_: &Exchange| Ok(Some("ftp://bad".to_string()))));
        assert!(rt.init_proxies(&ex).unwrap_err().is_invalid_proxy());
    }

    #[tokio::test]
    async fn h3_chain_validation() {
        let rt = transport();
        let mut ex = exchange("https://example.com/");
        ex.options_mut().h3 = true;

        let target = Address::parse("https://127.0.0.1:1").unwrap();
        let http_hop = vec![Address::parse("http://127.0.0.1:2").unwrap()];
        let err = rt.dial_h3(&ex, &http_hop, &target).await.unwrap_err();
        assert!(err.is_invalid_proxy());

        let long_chain = vec![
            Address::parse("socks5://127.0.0.1:2").unwrap(),
            Address::parse("socks5://127.0.0.1:3").unwrap(),
        ];
        let err = rt.dial_h3(&ex, &long_chain, &target).await.unwrap_err();
        assert!(err.is_invalid_proxy());
    }
}
