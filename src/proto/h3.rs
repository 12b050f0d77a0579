//! The HTTP/3 engine: h3 over a quinn session.

use bytes::{Buf, Bytes};
use http::Version;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub(crate) struct H3Conn {
    tx: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
}

/// Stand up an HTTP/3 client over an established QUIC session.
///
/// The driver task owns the control stream; when it settles (peer close,
/// idle timeout) or the connector is force-cancelled, the QUIC session is
/// closed and `force` is cancelled.
pub(crate) async fn attach_h3(
    session: quinn::Connection,
    force: &CancellationToken,
) -> Result<H3Conn> {
    let quinn_conn = h3_quinn::Connection::new(session.clone());
    let (mut driver, tx) = h3::client::new(quinn_conn).await.map_err(Error::quic)?;

    let drive = force.clone();
    tokio::spawn(async move {
        tokio::select! {
            closed = futures_util::future::poll_fn(|cx| driver.poll_close(cx)) => {
                if let Err(e) = closed {
                    log::debug!("http3 connection closed: {e}");
                }
            }
            _ = drive.cancelled() => {}
        }
        session.close(0u32.into(), b"");
        drive.cancel();
    });

    Ok(H3Conn { tx })
}

impl H3Conn {
    /// Send one request and wait for response headers. The response body
    /// streams through a channel fed by a per-request reader task.
    pub(crate) async fn send_request(
        &mut self,
        req: http::Request<hyper::Body>,
    ) -> Result<http::Response<hyper::Body>> {
        let (parts, body) = req.into_parts();
        // The engine writes DATA frames from buffered bytes; bodies were
        // either reusable or drained exactly once by this exchange.
        let body = hyper::body::to_bytes(body).await.map_err(Error::body)?;

        let mut request = http::Request::from_parts(parts, ());
        *request.version_mut() = Version::HTTP_3;

        let mut stream = self.tx.send_request(request).await.map_err(Error::protocol)?;
        if !body.is_empty() {
            stream.send_data(body).await.map_err(Error::protocol)?;
        }
        stream.finish().await.map_err(Error::protocol)?;

        let response = stream.recv_response().await.map_err(Error::protocol)?;
        let (mut parts, ()) = response.into_parts();
        parts.version = Version::HTTP_3;

        let (mut body_tx, response_body) = hyper::Body::channel();
        tokio::spawn(async move {
            loop {
                match stream.recv_data().await {
                    Ok(Some(mut chunk)) => {
                        let bytes = chunk.copy_to_bytes(chunk.remaining());
                        if body_tx.send_data(bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("http3 response body ended: {e}");
                        body_tx.abort();
                        break;
                    }
                }
            }
        });

        Ok(http::Response::from_parts(parts, response_body))
    }
}

impl std::fmt::Debug for H3Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Conn").finish()
    }
}
