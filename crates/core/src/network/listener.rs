use super::{wait_shutdown, Connector};
use crate::peer::PeerSource;
use crate::transport::{FrameTransport, TcpFrames, UdpFrames};
use lurker_common::protocol::MAX_FRAME_SIZE;
use lurker_common::Service;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Datagrams queued per UDP session before new ones are dropped
const SESSION_QUEUE: usize = 16;

/// Session table size that triggers pruning of finished sessions
const MAX_SESSIONS: usize = 1024;

/// Shared state handed to every per-connection task
#[derive(Debug, Clone)]
pub struct ListenerContext {
    /// Discovered peers, consumed by the registry
    pub sources: mpsc::Sender<PeerSource>,

    /// Our own descriptor, sent when dialing discovered peers back
    pub local: Arc<Service>,

    pub handshake_timeout: Duration,

    pub connect_timeout: Duration,

    pub keepalive_interval: Duration,

    pub shutdown: watch::Receiver<bool>,
}

impl ListenerContext {
    fn connector<T: FrameTransport>(&self, transport: T) -> Connector<T> {
        Connector::new(transport)
            .with_timeout(self.handshake_timeout)
            .with_keepalive_interval(self.keepalive_interval)
            .with_shutdown(self.shutdown.clone())
    }
}

/// Run the handshake on one transport and report the peer on success
async fn serve<T: FrameTransport>(mut connector: Connector<T>, ctx: ListenerContext) {
    let peer = connector.peer_addr();

    let Some(request) = connector.process().await else {
        return;
    };

    let service = request.service;
    let source = PeerSource::new(service.clone(), service.tcp_addr(peer.ip()), ctx.local.clone())
        .with_timeout(ctx.connect_timeout);

    if ctx.sources.send(source).await.is_err() {
        debug!("Source channel closed, dropping peer {}", service.id);
    }

    if request.keep_connect {
        if let Err(e) = connector.keep_connect().await {
            debug!("Keep-alive with {} ended: {}", service.id, e);
        }
    }
}

/// Accept TCP connections until shutdown, one task per connection
pub async fn accept_loop(listener: TcpListener, ctx: ListenerContext) {
    let mut shutdown = ctx.shutdown.clone();

    if let Ok(addr) = listener.local_addr() {
        info!("Accepting TCP handshakes on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                match TcpFrames::new(stream) {
                    Ok(transport) => {
                        tokio::spawn(serve(ctx.connector(transport), ctx.clone()));
                    }
                    Err(e) => warn!("Dropping connection from {}: {}", addr, e),
                }
            }
            Err(e) => warn!("Accept failed: {}", e),
        }
    }

    debug!("TCP accept loop stopped");
}

/// Demultiplex datagrams into per-peer sessions until shutdown
pub async fn datagram_loop(socket: Arc<UdpSocket>, ctx: ListenerContext) {
    let mut shutdown = ctx.shutdown.clone();
    let mut sessions: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    if let Ok(addr) = socket.local_addr() {
        info!("Accepting UDP handshakes on {}", addr);
    }

    loop {
        let received = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (n, from) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP unreachable from an earlier send surfaces here
                debug!("UDP receive failed: {}", e);
                continue;
            }
        };

        let mut datagram = buf[..n].to_vec();

        if let Some(inbox) = sessions.get(&from) {
            match inbox.try_send(datagram) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => {
                    debug!("Session with {} is busy, dropping datagram", from);
                    continue;
                }
                Err(TrySendError::Closed(returned)) => {
                    sessions.remove(&from);
                    datagram = returned;
                }
            }
        }

        if sessions.len() >= MAX_SESSIONS {
            sessions.retain(|_, inbox| !inbox.is_closed());
        }

        let (inbox, rx) = mpsc::channel(SESSION_QUEUE);
        if inbox.try_send(datagram).is_err() {
            continue;
        }
        sessions.insert(from, inbox);

        let transport = UdpFrames::session(socket.clone(), from, rx);
        tokio::spawn(serve(ctx.connector(transport), ctx.clone()));
    }

    debug!("UDP datagram loop stopped");
}
