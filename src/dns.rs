//! DNS resolution.
//!
//! The resolver is a seam: the transport consumes the [`Resolve`] trait and
//! ships a getaddrinfo-backed default. Custom resolvers (overrides, DoH, …)
//! plug in through [`RequestOptions::resolver`](crate::RequestOptions).

use std::{
    fmt,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

use crate::error::{BoxError, Error, Result};

/// Address family preference applied to resolved addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    /// Keep only IPv4 results.
    Ipv4,
    /// Keep only IPv6 results.
    Ipv6,
}

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from a string slice.
    #[inline]
    pub fn new(host: Box<str>) -> Name {
        Name { host }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value.into())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = std::result::Result<Addrs, BoxError>> + Send>>;

/// Trait for customizing DNS resolution.
///
/// The port of the returned `SocketAddr`s is ignored; the dialer applies the
/// port of the address being dialed.
pub trait Resolve: Send + Sync {
    /// Performs DNS resolution on a `Name`.
    fn resolve(&self, name: Name) -> Resolving;
}

/// The default resolver, backed by the system's getaddrinfo through tokio.
#[derive(Debug, Clone, Default)]
pub struct GaiResolver {
    _priv: (),
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((name.as_str(), 0)).await?;
            let addrs: Addrs = Box::new(addrs.collect::<Vec<_>>().into_iter());
            Ok(addrs)
        })
    }
}

/// Shared handle over a [`Resolve`] trait object.
#[derive(Clone)]
pub(crate) struct DynResolver {
    resolver: Arc<dyn Resolve>,
}

impl DynResolver {
    pub(crate) fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver }
    }

    pub(crate) fn gai() -> Self {
        Self::new(Arc::new(GaiResolver::default()))
    }

    /// Resolve `host` to socket addresses on `port`, honouring the address
    /// family filter. IP literals short-circuit resolution.
    pub(crate) async fn lookup(
        &self,
        host: &str,
        port: u16,
        addr_type: Option<AddrType>,
    ) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let addrs = self
            .resolver
            .resolve(Name::from(host))
            .await
            .map_err(Error::dns)?;
        let addrs: Vec<SocketAddr> = addrs
            .filter(|addr| match addr_type {
                Some(AddrType::Ipv4) => addr.is_ipv4(),
                Some(AddrType::Ipv6) => addr.is_ipv6(),
                None => true,
            })
            .map(|mut addr| {
                addr.set_port(port);
                addr
            })
            .collect();
        if addrs.is_empty() {
            return Err(Error::dns(format!("no suitable address for {host}")));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<SocketAddr>);

    impl Resolve for Fixed {
        fn resolve(&self, _name: Name) -> Resolving {
            let addrs = self.0.clone();
            Box::pin(async move {
                let addrs: Addrs = Box::new(addrs.into_iter());
                Ok(addrs)
            })
        }
    }

    #[tokio::test]
    async fn lookup_filters_by_family() {
        let resolver = DynResolver::new(Arc::new(Fixed(vec![
            "127.0.0.1:0".parse().unwrap(),
            "[::1]:0".parse().unwrap(),
        ])));

        let v4 = resolver.lookup("example.test", 80, Some(AddrType::Ipv4)).await.unwrap();
        assert!(v4.iter().all(|a| a.is_ipv4() && a.port() == 80));

        let v6 = resolver.lookup("example.test", 443, Some(AddrType::Ipv6)).await.unwrap();
        assert!(v6.iter().all(|a| a.is_ipv6() && a.port() == 443));
    }

    #[tokio::test]
    async fn lookup_errors_when_filter_empties() {
        let resolver = DynResolver::new(Arc::new(Fixed(vec!["127.0.0.1:0".parse().unwrap()])));
        let err = resolver
            .lookup("example.test", 80, Some(AddrType::Ipv6))
            .await
            .unwrap_err();
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn lookup_short_circuits_ip_literals() {
        let resolver = DynResolver::gai();
        let addrs = resolver.lookup("192.0.2.7", 8080, None).await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7:8080".parse().unwrap()]);
    }
}
