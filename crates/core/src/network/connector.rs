/// Responder side of the handshake
///
/// A `Connector` owns one live transport. It reads a single envelope,
/// dispatches on its kind, writes the matching response and then either
/// closes the transport or keeps it alive with periodic pings.

use crate::protocol::{
    HandshakeEnvelope, HandshakeKind, HandshakeRequest, HandshakeResponse,
};
use super::wait_shutdown;
use crate::transport::{with_deadline, FrameTransport};
use lurker_common::protocol::{
    HANDSHAKE_TIMEOUT_SECS, KEEPALIVE_INTERVAL_SECS, KEEPALIVE_MAX_IDLE_TICKS,
};
use lurker_common::{LurkerError, Result, Service};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The four responder actions an envelope kind maps to
pub trait HandshakeResponder {
    /// Full request/response handshake
    fn interaction(&mut self) -> impl Future<Output = Result<HandshakeRequest>> + Send;

    /// Answer a liveness check and close
    fn pong(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn intermediary(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn other(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Per-connection handshake responder
#[derive(Debug)]
pub struct Connector<T> {
    /// Peer identity, set once an interaction succeeds
    id: String,

    timeout: Duration,

    keepalive_interval: Duration,

    transport: T,

    /// Envelope already read by `process`, consumed by `interaction`
    pending: Option<HandshakeEnvelope>,

    /// Service descriptor declared by the peer
    peer_service: Option<Service>,

    shutdown: Option<watch::Receiver<bool>>,
}

impl<T: FrameTransport> Connector<T> {
    pub fn new(transport: T) -> Self {
        Self {
            id: String::new(),
            timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            transport,
            pending: None,
            peer_service: None,
            shutdown: None,
        }
    }

    /// Read/write deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Cancel the keep-alive loop when the value turns `true` or the
    /// sender is dropped
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Peer identity. Empty until an interaction has completed.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_service(&self) -> Option<&Service> {
        self.peer_service.as_ref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    async fn read_envelope(&mut self) -> Result<HandshakeEnvelope> {
        let frame = with_deadline(self.timeout, self.transport.recv_frame()).await?;
        HandshakeEnvelope::decode(&frame)
    }

    async fn write_response(&mut self, response: &HandshakeResponse) -> Result<usize> {
        let frame = response.encode()?;
        with_deadline(self.timeout, self.transport.send_frame(&frame)).await
    }

    async fn interact(&mut self) -> Result<HandshakeRequest> {
        let envelope = match self.pending.take() {
            Some(envelope) => envelope,
            None => self.read_envelope().await?,
        };

        if envelope.kind != HandshakeKind::Interaction {
            return Err(LurkerError::protocol(format!(
                "expected interaction, got {}",
                envelope.kind
            )));
        }

        let request = envelope.request()?;
        self.id = request.service.id.clone();

        debug!(
            "Handshake request from {} (id {}, keep_connect {})",
            self.peer_addr(),
            self.id,
            request.keep_connect
        );

        self.write_response(&HandshakeResponse::connected()).await?;
        self.peer_service = Some(request.service.clone());

        Ok(request)
    }

    /// Top-level entry point for an accepted transport.
    ///
    /// Reads one envelope and dispatches it. Returns the request when an
    /// interaction completed; every failure is logged and the transport
    /// closed without a response.
    pub async fn process(&mut self) -> Option<HandshakeRequest> {
        let peer = self.peer_addr();

        let envelope = match self.read_envelope().await {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping {} from {}: {}", self.transport.protocol(), peer, e);
                self.close().await;
                return None;
            }
        };

        match envelope.kind {
            HandshakeKind::Interaction => {
                self.pending = Some(envelope);
                match self.interaction().await {
                    Ok(request) => {
                        info!(
                            "Handshake with {} completed over {}",
                            request.service.id,
                            self.transport.protocol()
                        );
                        if !request.keep_connect {
                            self.close().await;
                        }
                        Some(request)
                    }
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", peer, e);
                        None
                    }
                }
            }
            HandshakeKind::Ping => {
                if let Err(e) = self.pong().await {
                    debug!("Pong to {} failed: {}", peer, e);
                }
                None
            }
            HandshakeKind::Intermediary => {
                if let Err(e) = self.intermediary().await {
                    debug!("Intermediary for {} failed: {}", peer, e);
                }
                self.close().await;
                None
            }
            HandshakeKind::Other => {
                if let Err(e) = self.other().await {
                    debug!("Other handler for {} failed: {}", peer, e);
                }
                self.close().await;
                None
            }
        }
    }

    /// Send a ping every interval until cancelled or the peer goes away.
    ///
    /// A datagram peer that sends nothing back for
    /// `KEEPALIVE_MAX_IDLE_TICKS` intervals is treated as gone.
    pub async fn keep_connect(&mut self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let interval = if self.keepalive_interval.is_zero() {
            Duration::from_secs(KEEPALIVE_INTERVAL_SECS)
        } else {
            self.keepalive_interval
        };
        let mut ticker = tokio::time::interval(interval);
        let mut idle_ticks = 0;
        // the first tick completes immediately
        ticker.tick().await;

        let ping = HandshakeEnvelope::ping().encode()?;
        let peer = self.peer_addr();

        debug!("Keeping connection to {} alive", peer);

        let result = loop {
            let cancelled = async {
                match shutdown.as_mut() {
                    Some(rx) => wait_shutdown(rx).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancelled => break Ok(()),
                _ = ticker.tick() => {}
            }

            match self.transport.drain_inbound() {
                Some(0) => idle_ticks += 1,
                Some(_) => idle_ticks = 0,
                None => {}
            }
            if idle_ticks >= KEEPALIVE_MAX_IDLE_TICKS {
                debug!("Peer {} silent for {} intervals", peer, idle_ticks);
                break Err(LurkerError::Timeout);
            }

            if let Err(e) = with_deadline(self.timeout, self.transport.send_frame(&ping)).await {
                debug!("Keep-alive to {} stopped: {}", peer, e);
                break Err(e);
            }
        };

        self.close().await;
        result
    }
}

impl<T: FrameTransport> HandshakeResponder for Connector<T> {
    /// Read a request, record the peer identity and acknowledge it.
    ///
    /// On failure the transport is closed. On success closing is left to
    /// the caller, which decides based on `keep_connect`.
    async fn interaction(&mut self) -> Result<HandshakeRequest> {
        let result = self.interact().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn pong(&mut self) -> Result<()> {
        let result = self.write_response(&HandshakeResponse::pong()).await;

        let result = match result {
            Ok(0) => {
                warn!("Pong to {} wrote no data", self.peer_addr());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        self.close().await;
        result
    }

    async fn intermediary(&mut self) -> Result<()> {
        debug!("Intermediary request from {} ignored", self.peer_addr());
        Ok(())
    }

    async fn other(&mut self) -> Result<()> {
        debug!("Unhandled handshake from {}", self.peer_addr());
        Ok(())
    }
}
