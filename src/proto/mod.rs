//! Protocol engines and the connector that owns them.
//!
//! A [`Connector`] is one physical connection bound to one engine instance:
//! hyper's per-connection HTTP/1 or HTTP/2 client halves over a byte
//! stream, or an HTTP/3 client over a QUIC session. Every engine gets a
//! drive task whose completion force-cancels the connector, so a transport
//! closed by the peer takes its dispatcher down with it.

pub(crate) mod h3;

use std::pin::Pin;

use bytes::Bytes;
use http::{header::HOST, HeaderMap, HeaderName, HeaderValue, Version};
use pin_project_lite::pin_project;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    address::Address,
    connect::BoxStream,
    error::{Error, Result},
    http2::Http2Fingerprint,
};

/// One live connection and its engine handle.
///
/// Cooperative drain happens at the pool level; the connector itself only
/// carries the hard-cancel token its engine task watches.
pub(crate) struct Connector {
    pub(crate) proto: ProtoConn,
    pub(crate) proxies: Vec<Address>,
    /// Hard cancel: kills the engine immediately.
    pub(crate) force: CancellationToken,
    /// Header order pinned by the connection's HTTP/2 fingerprint.
    pub(crate) h2_order: Option<Vec<HeaderName>>,
}

impl Connector {
    pub(crate) fn new(
        proto: ProtoConn,
        proxies: Vec<Address>,
        force: CancellationToken,
    ) -> Connector {
        Connector {
            proto,
            proxies,
            force,
            h2_order: None,
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("proxies", &self.proxies)
            .field("multiplex", &self.proto.is_multiplex())
            .finish()
    }
}

/// Signalled when an HTTP/1 response body has been fully consumed (or
/// dropped); the connector is not reusable before then.
pub(crate) type BodyDone = oneshot::Receiver<()>;

pub(crate) enum ProtoConn {
    Hyper {
        tx: hyper::client::conn::SendRequest<hyper::Body>,
        h2: bool,
    },
    H3(h3::H3Conn),
}

impl ProtoConn {
    /// Whether the engine multiplexes exchanges on one connection.
    pub(crate) fn is_multiplex(&self) -> bool {
        match self {
            ProtoConn::Hyper { h2, .. } => *h2,
            ProtoConn::H3(_) => true,
        }
    }

    /// Perform one exchange: send the request, wait for response headers.
    ///
    /// For HTTP/1 the returned [`BodyDone`] resolves when the body has been
    /// read to the end; the dispatcher must not start another exchange on
    /// this connection before that.
    pub(crate) async fn send_request(
        &mut self,
        mut req: http::Request<hyper::Body>,
        order: Option<&[HeaderName]>,
    ) -> Result<(http::Response<hyper::Body>, Option<BodyDone>)> {
        if let Some(order) = order {
            apply_header_order(req.headers_mut(), order);
        }
        match self {
            ProtoConn::Hyper { tx, h2 } => {
                prepare_hyper_request(&mut req, *h2)?;
                futures_util::future::poll_fn(|cx| tx.poll_ready(cx))
                    .await
                    .map_err(Error::protocol)?;
                let response = tx.send_request(req).await.map_err(Error::protocol)?;
                if *h2 {
                    Ok((response, None))
                } else {
                    let (parts, body) = response.into_parts();
                    let (done_tx, done_rx) = oneshot::channel();
                    let body = hyper::Body::wrap_stream(TrackedBody {
                        inner: body,
                        done: Some(done_tx),
                    });
                    Ok((http::Response::from_parts(parts, body), Some(done_rx)))
                }
            }
            ProtoConn::H3(conn) => {
                let response = conn.send_request(req).await?;
                Ok((response, None))
            }
        }
    }
}

/// Wrap an established stream in hyper's per-connection client engine.
///
/// The spawned drive task owns the connection; when the transport closes
/// (peer reset, force cancel) the task ends and cancels `force`.
pub(crate) async fn attach_hyper(
    stream: BoxStream,
    h2: bool,
    fingerprint: Option<&Http2Fingerprint>,
    force: &CancellationToken,
) -> Result<ProtoConn> {
    let mut builder = hyper::client::conn::Builder::new();
    if h2 {
        builder.http2_only(true);
        if let Some(fp) = fingerprint {
            fp.apply(&mut builder);
        }
    }
    let (tx, conn) = builder
        .handshake::<_, hyper::Body>(stream)
        .await
        .map_err(Error::protocol)?;

    let drive = force.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = conn => {
                if let Err(e) = result {
                    log::debug!("connection task ended: {e}");
                }
            }
            _ = drive.cancelled() => {}
        }
        drive.cancel();
    });

    Ok(ProtoConn::Hyper { tx, h2 })
}

/// Rebuild the request the way the engine's serializer expects it.
///
/// HTTP/1 wants origin-form and an explicit Host; HTTP/2 keeps the absolute
/// URI (the engine derives `:scheme`/`:authority` from it) and must not see
/// a Host header.
fn prepare_hyper_request(req: &mut http::Request<hyper::Body>, h2: bool) -> Result<()> {
    if h2 {
        *req.version_mut() = Version::HTTP_2;
        req.headers_mut().remove(HOST);
        return Ok(());
    }

    *req.version_mut() = Version::HTTP_11;
    if !req.headers().contains_key(HOST) {
        let host = host_header_value(req.uri())
            .ok_or_else(|| Error::protocol("request uri has no host"))?;
        // Host leads the header block unless the caller ordered otherwise.
        let mut headers = HeaderMap::with_capacity(req.headers().len() + 1);
        headers.insert(HOST, host);
        for (name, value) in req.headers().iter() {
            headers.append(name.clone(), value.clone());
        }
        *req.headers_mut() = headers;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| http::uri::PathAndQuery::from_static("/"));
    *req.uri_mut() = http::Uri::from(path_and_query);
    Ok(())
}

fn host_header_value(uri: &http::Uri) -> Option<HeaderValue> {
    let host = uri.host()?;
    let default_port = match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    let rendered = match uri.port_u16() {
        Some(port) if port != default_port => format!("{host}:{port}"),
        _ => host.to_string(),
    };
    HeaderValue::from_str(&rendered).ok()
}

/// Rewrite `headers` so names listed in `order` lead, in that order, with
/// unlisted headers appended in their insertion order.
pub(crate) fn apply_header_order(headers: &mut HeaderMap, order: &[HeaderName]) {
    let mut ordered = HeaderMap::with_capacity(headers.len());
    for name in order {
        for value in headers.get_all(name) {
            ordered.append(name.clone(), value.clone());
        }
    }
    for (name, value) in headers.iter() {
        if !order.contains(name) {
            ordered.append(name.clone(), value.clone());
        }
    }
    *headers = ordered;
}

pin_project! {
    /// Streams an HTTP/1 response body while reporting when it ends, by
    /// read-through or by drop.
    struct TrackedBody {
        #[pin]
        inner: hyper::Body,
        done: Option<oneshot::Sender<()>>,
    }

    impl PinnedDrop for TrackedBody {
        fn drop(this: Pin<&mut Self>) {
            if let Some(done) = this.project().done.take() {
                let _ = done.send(());
            }
        }
    }
}

impl futures_core::Stream for TrackedBody {
    type Item = std::result::Result<Bytes, hyper::Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use hyper::body::HttpBody;
        use std::task::Poll;

        let this = self.project();
        match futures_core::ready!(HttpBody::poll_data(this.inner, cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(e)) => {
                if let Some(done) = this.done.take() {
                    let _ = done.send(());
                }
                Poll::Ready(Some(Err(e)))
            }
            None => {
                if let Some(done) = this.done.take() {
                    let _ = done.send(());
                }
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &'static str) -> HeaderName {
        HeaderName::from_static(s)
    }

    #[test]
    fn header_order_moves_listed_names_first() {
        let mut headers = HeaderMap::new();
        headers.insert(name("accept"), HeaderValue::from_static("*/*"));
        headers.insert(name("user-agent"), HeaderValue::from_static("wirereq"));
        headers.insert(name("x-custom"), HeaderValue::from_static("1"));
        headers.append(name("x-custom"), HeaderValue::from_static("2"));

        apply_header_order(&mut headers, &[name("user-agent"), name("accept")]);

        let order: Vec<_> = headers.iter().map(|(n, _)| n.as_str().to_string()).collect();
        assert_eq!(order, ["user-agent", "accept", "x-custom", "x-custom"]);
        let customs: Vec<_> = headers.get_all("x-custom").iter().collect();
        assert_eq!(customs.len(), 2);
    }

    #[test]
    fn prepare_h1_sets_host_and_origin_form() {
        let mut req = http::Request::builder()
            .uri("https://example.com/path?q=1")
            .body(hyper::Body::empty())
            .unwrap();
        prepare_hyper_request(&mut req, false).unwrap();
        assert_eq!(req.uri().to_string(), "/path?q=1");
        assert_eq!(req.headers().get(HOST).unwrap(), "example.com");
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[test]
    fn prepare_h1_keeps_non_default_port() {
        let mut req = http::Request::builder()
            .uri("http://example.com:8080/x")
            .body(hyper::Body::empty())
            .unwrap();
        prepare_hyper_request(&mut req, false).unwrap();
        assert_eq!(req.headers().get(HOST).unwrap(), "example.com:8080");
    }

    #[test]
    fn prepare_h2_strips_host_and_keeps_authority() {
        let mut req = http::Request::builder()
            .uri("https://example.com/path")
            .header(HOST, "example.com")
            .body(hyper::Body::empty())
            .unwrap();
        prepare_hyper_request(&mut req, true).unwrap();
        assert!(req.headers().get(HOST).is_none());
        assert_eq!(req.uri().to_string(), "https://example.com/path");
        assert_eq!(req.version(), Version::HTTP_2);
    }
}
