//! SOCKS5 UDP ASSOCIATE (RFC 1928 section 7) for proxied HTTP/3.
//!
//! TCP-side SOCKS5 tunneling goes through tokio-socks; the UDP relay has no
//! such helper, so the ASSOCIATE handshake and the per-datagram
//! encapsulation live here. The relay socket is exposed to quinn as an
//! [`AsyncUdpSocket`](quinn::AsyncUdpSocket) that prepends the request
//! header on send and strips it on receive. The TCP control connection is
//! held inside the socket: the association lives exactly as long as it does.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::task::{Context, Poll};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use crate::address::Address;
use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Negotiate a UDP association over `control`, returning the relay address
/// datagrams must be sent to.
pub(crate) async fn udp_associate(hop: &Address, control: &mut TcpStream) -> Result<SocketAddr> {
    // method selection
    let greeting: &[u8] = if hop.username.is_some() {
        &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NONE]
    };
    control.write_all(greeting).await.map_err(Error::connect)?;

    let mut chosen = [0u8; 2];
    control.read_exact(&mut chosen).await.map_err(Error::connect)?;
    if chosen[0] != SOCKS_VERSION {
        return Err(Error::connect("socks5 proxy speaks wrong version"));
    }
    match chosen[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => {
            let user = hop.username.as_deref().unwrap_or("");
            let pass = hop.password.as_deref().unwrap_or("");
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::connect("socks5 credentials too long"));
            }
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01);
            req.push(user.len() as u8);
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            control.write_all(&req).await.map_err(Error::connect)?;

            let mut status = [0u8; 2];
            control.read_exact(&mut status).await.map_err(Error::connect)?;
            if status[1] != 0x00 {
                return Err(Error::connect("socks5 authentication rejected"));
            }
        }
        0xff => return Err(Error::connect("socks5 proxy accepts none of our methods")),
        other => {
            return Err(Error::connect(format!(
                "socks5 proxy chose unsupported method {other:#04x}"
            )));
        }
    }

    // ASSOCIATE with an unspecified client address: we bind after learning
    // the relay's family.
    control
        .write_all(&[
            SOCKS_VERSION,
            CMD_UDP_ASSOCIATE,
            0x00,
            ATYP_V4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await
        .map_err(Error::connect)?;

    let mut head = [0u8; 4];
    control.read_exact(&mut head).await.map_err(Error::connect)?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::connect("socks5 proxy speaks wrong version"));
    }
    if head[1] != 0x00 {
        return Err(Error::connect(format!(
            "socks5 udp associate refused, rep {:#04x}",
            head[1]
        )));
    }
    let bound = read_bound_addr(control, head[3]).await?;

    // An unspecified BND.ADDR means "same host as the control connection".
    let ip = if bound.ip().is_unspecified() {
        control.peer_addr().map_err(Error::connect)?.ip()
    } else {
        bound.ip()
    };
    Ok(SocketAddr::new(ip, bound.port()))
}

async fn read_bound_addr(control: &mut TcpStream, atyp: u8) -> Result<SocketAddr> {
    match atyp {
        ATYP_V4 => {
            let mut raw = [0u8; 6];
            control.read_exact(&mut raw).await.map_err(Error::connect)?;
            let ip: [u8; 4] = [raw[0], raw[1], raw[2], raw[3]];
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(SocketAddr::from((ip, port)))
        }
        ATYP_V6 => {
            let mut raw = [0u8; 18];
            control.read_exact(&mut raw).await.map_err(Error::connect)?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(SocketAddr::from((ip, port)))
        }
        ATYP_DOMAIN => Err(Error::connect(
            "socks5 relay bound to a domain name, which is unsupported",
        )),
        other => Err(Error::connect(format!(
            "socks5 reply carries unknown address type {other:#04x}"
        ))),
    }
}

/// The request header prepended to every relayed datagram.
fn udp_header(target: SocketAddr) -> Vec<u8> {
    let mut header = vec![0x00, 0x00, 0x00];
    match target {
        SocketAddr::V4(sa) => {
            header.push(ATYP_V4);
            header.extend_from_slice(&sa.ip().octets());
        }
        SocketAddr::V6(sa) => {
            header.push(ATYP_V6);
            header.extend_from_slice(&sa.ip().octets());
        }
    }
    header.extend_from_slice(&target.port().to_be_bytes());
    header
}

/// Strip the relay header off an inbound datagram; fragments are refused.
fn strip_udp_header(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < 4 || datagram[2] != 0x00 {
        return None;
    }
    let offset = match datagram[3] {
        ATYP_V4 => 4 + 4 + 2,
        ATYP_V6 => 4 + 16 + 2,
        ATYP_DOMAIN => 4 + 1 + (*datagram.get(4)? as usize) + 2,
        _ => return None,
    };
    datagram.get(offset..)
}

/// Open the relay socket for an established UDP association.
pub(crate) async fn relay_socket(
    hop: &Address,
    mut control: TcpStream,
    target: SocketAddr,
) -> Result<SocksUdpSocket> {
    let relay = udp_associate(hop, &mut control).await?;
    let local: SocketAddr = if relay.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let io = UdpSocket::bind(local).await.map_err(Error::connect)?;
    Ok(SocksUdpSocket {
        io,
        relay,
        target,
        header: udp_header(target),
        _control: control,
    })
}

/// A UDP socket whose datagrams travel through a SOCKS5 relay.
pub(crate) struct SocksUdpSocket {
    io: UdpSocket,
    relay: SocketAddr,
    target: SocketAddr,
    header: Vec<u8>,
    // Dropping the control connection tears down the association.
    _control: TcpStream,
}

impl fmt::Debug for SocksUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksUdpSocket")
            .field("relay", &self.relay)
            .field("target", &self.target)
            .finish()
    }
}

impl quinn::AsyncUdpSocket for SocksUdpSocket {
    fn poll_send(
        &self,
        _state: &quinn::udp::UdpState,
        cx: &mut Context,
        transmits: &[quinn::udp::Transmit],
    ) -> Poll<io::Result<usize>> {
        let mut sent = 0;
        for transmit in transmits {
            let contents = &transmit.contents[..];
            let segment = transmit.segment_size.unwrap_or(contents.len().max(1));
            for chunk in contents.chunks(segment) {
                let mut datagram = Vec::with_capacity(self.header.len() + chunk.len());
                datagram.extend_from_slice(&self.header);
                datagram.extend_from_slice(chunk);
                match self.io.poll_send_to(cx, &datagram, self.relay) {
                    Poll::Ready(Ok(_)) => {}
                    Poll::Ready(Err(e)) => {
                        if sent == 0 {
                            return Poll::Ready(Err(e));
                        }
                        return Poll::Ready(Ok(sent));
                    }
                    Poll::Pending => {
                        if sent == 0 {
                            return Poll::Pending;
                        }
                        return Poll::Ready(Ok(sent));
                    }
                }
            }
            sent += 1;
        }
        Poll::Ready(Ok(sent))
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [quinn::udp::RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());
        let mut scratch = [0u8; 65535];
        loop {
            let mut buf = ReadBuf::new(&mut scratch);
            match self.io.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(_from)) => {
                    let payload = match strip_udp_header(buf.filled()) {
                        Some(payload) if payload.len() <= bufs[0].len() => payload,
                        // malformed or oversized relay datagram: drop it
                        _ => continue,
                    };
                    let len = payload.len();
                    bufs[0][..len].copy_from_slice(payload);
                    let mut m = quinn::udp::RecvMeta::default();
                    m.addr = self.target;
                    m.len = len;
                    m.stride = len.max(1);
                    meta[0] = m;
                    return Poll::Ready(Ok(1));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_target() {
        let target: SocketAddr = "192.0.2.7:443".parse().unwrap();
        let header = udp_header(target);
        assert_eq!(header, vec![0, 0, 0, ATYP_V4, 192, 0, 2, 7, 0x01, 0xbb]);

        let target: SocketAddr = "[2001:db8::1]:8443".parse().unwrap();
        let header = udp_header(target);
        assert_eq!(header.len(), 4 + 16 + 2);
        assert_eq!(header[3], ATYP_V6);
    }

    #[test]
    fn strip_rejects_fragments_and_garbage() {
        let target: SocketAddr = "192.0.2.7:443".parse().unwrap();
        let mut datagram = udp_header(target);
        datagram.extend_from_slice(b"payload");
        assert_eq!(strip_udp_header(&datagram), Some(&b"payload"[..]));

        // fragmented
        let mut fragged = datagram.clone();
        fragged[2] = 0x01;
        assert_eq!(strip_udp_header(&fragged), None);

        assert_eq!(strip_udp_header(b"\x00\x00"), None);
        assert_eq!(strip_udp_header(b"\x00\x00\x00\x09rest"), None);
    }

    #[tokio::test]
    async fn associate_against_mock_proxy() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], CMD_UDP_ASSOCIATE);
            // relay bound at 127.0.0.1:4567
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x11, 0xd7])
                .await
                .unwrap();
            // hold the association open until the client is done
            let mut end = [0u8; 1];
            let _ = sock.read(&mut end).await;
        });

        let hop = Address::parse(&format!("socks5://{proxy_addr}")).unwrap();
        let mut control = TcpStream::connect(proxy_addr).await.unwrap();
        let relay = udp_associate(&hop, &mut control).await.unwrap();
        assert_eq!(relay, "127.0.0.1:4567".parse().unwrap());
    }
}
