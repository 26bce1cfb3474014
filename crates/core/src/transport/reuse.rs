/// Sockets with local port reuse
///
/// Listening sockets and outbound dials both set `SO_REUSEADDR` (and
/// `SO_REUSEPORT` on unix), so an outbound connection can originate from a
/// port that is already listening. A local port of 0 binds an ephemeral port.

use lurker_common::Result;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

const LISTEN_BACKLOG: i32 = 1024;

fn reusable_socket(addr: &SocketAddr, ty: Type, protocol: Protocol) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), ty, Some(protocol))?;

    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(*addr))?;

    Ok(socket)
}

/// Unspecified local address of the same family as `remote`
fn local_for(remote: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

/// Bind a TCP listener that reverse dials may share
pub fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = reusable_socket(&addr, Type::STREAM, Protocol::TCP)?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
}

/// Bind a UDP socket that hole punching dials may share
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = reusable_socket(&addr, Type::DGRAM, Protocol::UDP)?;

    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket)?)
}

/// Dial `remote` over TCP from `local_port`
pub async fn dial_tcp(local_port: u16, remote: SocketAddr) -> Result<TcpStream> {
    let local = local_for(&remote, local_port);
    let socket = reusable_socket(&local, Type::STREAM, Protocol::TCP)?;

    debug!("Dialing {} over TCP from {}", remote, local);

    let socket = TcpSocket::from_std_stream(socket.into());
    Ok(socket.connect(remote).await?)
}

/// Create a UDP socket on `local_port` connected to `remote`
pub async fn dial_udp(local_port: u16, remote: SocketAddr) -> Result<UdpSocket> {
    let local = local_for(&remote, local_port);
    let socket = reusable_socket(&local, Type::DGRAM, Protocol::UDP)?;

    debug!("Dialing {} over UDP from {}", remote, local);

    let socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(socket)?;
    socket.connect(remote).await?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn any_port() -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn test_dial_tcp_ephemeral() {
        let listener = bind_tcp_listener(any_port()).unwrap();
        let port = listener.local_addr().unwrap().port();

        let (dialed, accepted) = tokio::join!(dial_tcp(0, loopback(port)), listener.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _) = accepted.unwrap();

        dialed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dial_tcp_from_listening_port() {
        let local = bind_tcp_listener(any_port()).unwrap();
        let local_port = local.local_addr().unwrap().port();

        let remote = bind_tcp_listener(any_port()).unwrap();
        let remote_port = remote.local_addr().unwrap().port();

        let (dialed, accepted) =
            tokio::join!(dial_tcp(local_port, loopback(remote_port)), remote.accept());
        let dialed = dialed.unwrap();
        let (_, from) = accepted.unwrap();

        assert_eq!(dialed.local_addr().unwrap().port(), local_port);
        assert_eq!(from.port(), local_port);
    }

    #[tokio::test]
    async fn test_dial_udp() {
        let listener = bind_udp(any_port()).unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialed = dial_udp(0, loopback(port)).await.unwrap();
        dialed.send(b"punch").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"punch");

        listener.send_to(b"back", from).await.unwrap();
        let n = dialed.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[tokio::test]
    async fn test_dial_tcp_refused() {
        let port = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };

        assert!(dial_tcp(0, loopback(port)).await.is_err());
    }
}
