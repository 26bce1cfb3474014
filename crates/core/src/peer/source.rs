/// Peer sources and the two-leg connection attempt
///
/// A source pairs a peer's advertised `Service` with an address to reach it
/// on. `try_connect` runs a reverse TCP dial and a UDP hole punch at the same
/// time and reports both results once both legs have finished.

use crate::protocol::{HandshakeEnvelope, HandshakeRequest, HandshakeResponse};
use crate::transport::{reuse, with_deadline, FrameTransport, TcpFrames, UdpFrames};
use lurker_common::protocol::CONNECT_TIMEOUT_SECS;
use lurker_common::{Addr, LurkerError, Protocol, Result, Service};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A peer reference capable of attempting a connection
pub trait Source: Send + Sync + 'static {
    /// Service descriptor the peer advertised
    fn service(&self) -> &Service;

    /// Identity used to deduplicate attempts
    fn id(&self) -> &str {
        &self.service().id
    }

    /// Attempt both connection paths and wait for both to settle
    fn try_connect(&self) -> impl Future<Output = ConnectOutcome> + Send;
}

/// Which paths to a peer completed the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    BothFailed,
    TcpOnly,
    UdpOnly,
    Both,
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        !matches!(self, Reachability::BothFailed)
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reachability::BothFailed => "unreachable",
            Reachability::TcpOnly => "tcp only",
            Reachability::UdpOnly => "udp only",
            Reachability::Both => "tcp and udp",
        };
        f.write_str(s)
    }
}

/// Result of both legs of a connection attempt
#[derive(Debug)]
pub struct ConnectOutcome {
    pub tcp: Result<HandshakeResponse>,
    pub udp: Result<HandshakeResponse>,
}

impl ConnectOutcome {
    pub fn reachability(&self) -> Reachability {
        match (self.tcp.is_ok(), self.udp.is_ok()) {
            (true, true) => Reachability::Both,
            (true, false) => Reachability::TcpOnly,
            (false, true) => Reachability::UdpOnly,
            (false, false) => Reachability::BothFailed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.reachability().is_reachable()
    }

    /// The error of the last leg checked: UDP if it failed, otherwise TCP
    pub fn last_error(&self) -> Option<&LurkerError> {
        match (&self.tcp, &self.udp) {
            (_, Err(e)) => Some(e),
            (Err(e), Ok(_)) => Some(e),
            (Ok(_), Ok(_)) => None,
        }
    }

    /// Collapse into a single result carrying the last error
    pub fn into_result(self) -> Result<Reachability> {
        let reachability = self.reachability();
        match (self.tcp, self.udp) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Ok(_), Ok(_)) => Ok(reachability),
        }
    }
}

/// A peer reachable through a TCP address and a UDP hole address
#[derive(Debug, Clone)]
pub struct PeerSource {
    service: Service,

    /// Target of the reverse TCP leg
    addr: Addr,

    /// Target of the UDP leg
    hole_addr: Addr,

    /// Our own descriptor, sent as the handshake request
    local: Arc<Service>,

    timeout: Duration,
}

impl PeerSource {
    /// The hole address defaults to the peer IP at its advertised hole port
    pub fn new(service: Service, addr: Addr, local: Arc<Service>) -> Self {
        let hole_addr = Addr::udp(addr.ip, service.port_hole);
        Self {
            service,
            addr: addr.with_protocol(Protocol::Tcp),
            hole_addr,
            local,
            timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }

    /// Bound applied to each leg's dial, write and read
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_hole_addr(mut self, hole_addr: Addr) -> Self {
        self.hole_addr = hole_addr.with_protocol(Protocol::Udp);
        self
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn hole_addr(&self) -> Addr {
        self.hole_addr
    }

    pub fn local(&self) -> &Service {
        &self.local
    }

    fn request(&self) -> HandshakeRequest {
        HandshakeRequest::new(self.local.as_ref().clone())
    }

    /// Reverse TCP: dial from the peer's advertised TCP port
    async fn try_reverse_tcp(&self) -> Result<HandshakeResponse> {
        let stream = with_deadline(
            self.timeout,
            reuse::dial_tcp(self.service.port_tcp, self.addr.socket_addr()),
        )
        .await?;

        let transport = TcpFrames::new(stream)?;
        initiate(transport, &self.request(), self.timeout).await
    }

    /// UDP hole punch: send from the peer's advertised hole port
    async fn try_reverse_udp(&self) -> Result<HandshakeResponse> {
        let socket = reuse::dial_udp(self.service.port_hole, self.hole_addr.socket_addr()).await?;

        let transport = UdpFrames::connected(socket)?;
        initiate(transport, &self.request(), self.timeout).await
    }
}

impl Source for PeerSource {
    fn service(&self) -> &Service {
        &self.service
    }

    async fn try_connect(&self) -> ConnectOutcome {
        debug!(
            "Trying {} via tcp {} and udp {}",
            self.service.id, self.addr, self.hole_addr
        );

        let (tcp, udp) = tokio::join!(self.try_reverse_tcp(), self.try_reverse_udp());

        if let Err(e) = &tcp {
            warn!("Reverse TCP to {} failed: {}", self.addr, e);
        }
        if let Err(e) = &udp {
            warn!("UDP hole punch to {} failed: {}", self.hole_addr, e);
        }

        let outcome = ConnectOutcome { tcp, udp };
        info!("Peer {} is {}", self.service.id, outcome.reachability());
        outcome
    }
}

/// Initiator side of the handshake: send the request, read one response,
/// close. A non-success status is an error.
pub async fn initiate<T: FrameTransport>(
    mut transport: T,
    request: &HandshakeRequest,
    timeout: Duration,
) -> Result<HandshakeResponse> {
    let result = exchange(&mut transport, request, timeout).await;
    transport.close().await;

    result?.ensure_success()
}

async fn exchange<T: FrameTransport>(
    transport: &mut T,
    request: &HandshakeRequest,
    timeout: Duration,
) -> Result<HandshakeResponse> {
    let frame = HandshakeEnvelope::interaction(request)?.encode()?;
    with_deadline(timeout, transport.send_frame(&frame)).await?;

    with_deadline(timeout, recv_response(transport)).await
}

/// Read until a frame decodes as a response. A peer punching toward us at the
/// same moment may send its own interaction first.
async fn recv_response<T: FrameTransport>(transport: &mut T) -> Result<HandshakeResponse> {
    loop {
        let frame = transport.recv_frame().await?;
        match HandshakeResponse::decode(&frame) {
            Ok(response) => return Ok(response),
            Err(e) => debug!("Skipping non-response frame from {}: {}", transport.peer_addr(), e),
        }
    }
}
