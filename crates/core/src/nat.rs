use lurker_common::{LurkerError, Result};
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Default route target. Nothing is sent to it.
const DEFAULT_ROUTE_TARGET: ([u8; 4], u16) = ([8, 8, 8, 8], 80);

/// Local address discovery
pub trait Nat: Send + Sync {
    /// Address of the interface that routes to the outside world
    fn internal_address(&self) -> Result<IpAddr>;
}

/// Finds the internal address by asking the OS which interface would be
/// used to reach a route target
#[derive(Debug, Clone)]
pub struct LocalNat {
    route_target: SocketAddr,
}

impl LocalNat {
    pub fn new() -> Self {
        Self {
            route_target: SocketAddr::from(DEFAULT_ROUTE_TARGET),
        }
    }

    pub fn with_route_target(route_target: SocketAddr) -> Self {
        Self { route_target }
    }
}

impl Default for LocalNat {
    fn default() -> Self {
        Self::new()
    }
}

impl Nat for LocalNat {
    fn internal_address(&self) -> Result<IpAddr> {
        let bind: SocketAddr = if self.route_target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        // connect on a UDP socket only selects a route
        let socket = UdpSocket::bind(bind)?;
        socket
            .connect(self.route_target)
            .map_err(|e| LurkerError::network(format!("no route to {}: {}", self.route_target, e)))?;

        Ok(socket.local_addr()?.ip())
    }
}
