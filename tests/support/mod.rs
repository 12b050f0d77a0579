pub mod server;

use std::net::SocketAddr;

use wirereq::dns::{Addrs, Name, Resolve, Resolving};

/// Resolves every hostname to loopback, so tests can address local servers
/// through distinct fake domains.
#[allow(unused)]
pub struct LoopbackDns;

impl Resolve for LoopbackDns {
    fn resolve(&self, _name: Name) -> Resolving {
        Box::pin(async {
            let addrs: Addrs = Box::new(std::iter::once(SocketAddr::from(([127, 0, 0, 1], 0))));
            Ok(addrs)
        })
    }
}
