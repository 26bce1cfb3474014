use lurker_common::protocol::MAX_FRAME_SIZE;
use lurker_common::{LurkerError, Protocol, Result};
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::debug;

/// A message-oriented view over one live connection
pub trait FrameTransport: Send {
    /// Receive one complete frame
    fn recv_frame(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Send one frame, returning the number of payload bytes written
    fn send_frame(&mut self, frame: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Close the transport. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    fn is_closed(&self) -> bool;

    fn peer_addr(&self) -> SocketAddr;

    fn protocol(&self) -> Protocol;

    /// Discard frames already waiting, without blocking, and return how
    /// many there were. `None` when the transport cannot tell; a stream
    /// learns that its peer left from failed writes instead.
    fn drain_inbound(&mut self) -> Option<usize> {
        None
    }
}

/// Length-prefixed frames over a TCP stream.
///
/// Each frame is a 4-byte little-endian length followed by the body.
#[derive(Debug)]
pub struct TcpFrames {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpFrames {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(LurkerError::Closed)
    }
}

impl FrameTransport for TcpFrames {
    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream()?;

        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(LurkerError::Closed),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(LurkerError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        Ok(data)
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<usize> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(LurkerError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let stream = self.stream()?;

        let mut buf = Vec::with_capacity(frame.len() + 4);
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);

        stream.write_all(&buf).await?;
        stream.flush().await?;

        Ok(frame.len())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.peer, e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}

#[derive(Debug)]
enum UdpInner {
    /// Socket connected to the peer; owns its own receive path
    Connected(UdpSocket),

    /// Shared listening socket; inbound datagrams arrive through a channel
    Shared {
        socket: Arc<UdpSocket>,
        inbox: mpsc::Receiver<Vec<u8>>,
    },
}

/// Datagram frames: one datagram is one frame
#[derive(Debug)]
pub struct UdpFrames {
    inner: Option<UdpInner>,
    peer: SocketAddr,
}

impl UdpFrames {
    /// Wrap a socket already connected to its peer
    pub fn connected(socket: UdpSocket) -> Result<Self> {
        let peer = socket.peer_addr()?;
        Ok(Self {
            inner: Some(UdpInner::Connected(socket)),
            peer,
        })
    }

    /// A session on a shared listening socket, fed by the listener loop
    pub fn session(socket: Arc<UdpSocket>, peer: SocketAddr, inbox: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            inner: Some(UdpInner::Shared { socket, inbox }),
            peer,
        }
    }
}

impl FrameTransport for UdpFrames {
    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        match self.inner.as_mut() {
            Some(UdpInner::Connected(socket)) => {
                let mut buf = vec![0u8; MAX_FRAME_SIZE];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            Some(UdpInner::Shared { inbox, .. }) => inbox.recv().await.ok_or(LurkerError::Closed),
            None => Err(LurkerError::Closed),
        }
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<usize> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(LurkerError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let peer = self.peer;
        match self.inner.as_mut() {
            Some(UdpInner::Connected(socket)) => Ok(socket.send(frame).await?),
            Some(UdpInner::Shared { socket, .. }) => Ok(socket.send_to(frame, peer).await?),
            None => Err(LurkerError::Closed),
        }
    }

    async fn close(&mut self) {
        self.inner = None;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn drain_inbound(&mut self) -> Option<usize> {
        let mut drained = 0;
        match self.inner.as_mut()? {
            UdpInner::Connected(socket) => {
                let mut buf = [0u8; 2048];
                // errors include WouldBlock and queued ICMP reports
                while socket.try_recv(&mut buf).is_ok() {
                    drained += 1;
                }
            }
            UdpInner::Shared { inbox, .. } => {
                while inbox.try_recv().is_ok() {
                    drained += 1;
                }
            }
        }
        Some(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpFrames, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            TcpFrames::new(accepted.unwrap().0).unwrap(),
            client.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_tcp_frames_exchange() {
        let (mut server, client) = tcp_pair().await;
        let mut client = TcpFrames::new(client).unwrap();

        client.send_frame(b"hello").await.unwrap();
        assert_eq!(server.recv_frame().await.unwrap(), b"hello");

        server.send_frame(b"").await.unwrap();
        assert!(client.recv_frame().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tcp_frames_reject_oversized_prefix() {
        let (mut server, mut client) = tcp_pair().await;

        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes())
            .await
            .unwrap();

        assert!(matches!(
            server.recv_frame().await,
            Err(LurkerError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_frames_peer_close() {
        let (mut server, client) = tcp_pair().await;
        drop(client);

        assert!(matches!(server.recv_frame().await, Err(LurkerError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_frames_closed() {
        let (mut server, _client) = tcp_pair().await;
        server.close().await;
        server.close().await;

        assert!(server.is_closed());
        assert!(matches!(server.send_frame(b"x").await, Err(LurkerError::Closed)));
    }

    #[tokio::test]
    async fn test_udp_session_and_connected() {
        let shared = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_socket.connect(shared.local_addr().unwrap()).await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();
        let mut client = UdpFrames::connected(client_socket).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let mut session = UdpFrames::session(shared, client_addr, rx);

        tx.send(b"inbound".to_vec()).await.unwrap();
        assert_eq!(session.recv_frame().await.unwrap(), b"inbound");

        session.send_frame(b"reply").await.unwrap();
        assert_eq!(client.recv_frame().await.unwrap(), b"reply");

        session.close().await;
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_udp_drain_inbound() {
        let shared = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let mut session = UdpFrames::session(shared, peer, rx);

        assert_eq!(session.drain_inbound(), Some(0));
        tx.send(b"a".to_vec()).await.unwrap();
        tx.send(b"b".to_vec()).await.unwrap();
        assert_eq!(session.drain_inbound(), Some(2));
        assert_eq!(session.drain_inbound(), Some(0));

        session.close().await;
        assert_eq!(session.drain_inbound(), None);
    }

    #[tokio::test]
    async fn test_tcp_cannot_drain() {
        let (mut server, _client) = tcp_pair().await;
        assert_eq!(server.drain_inbound(), None);
    }
}
