/// Lurker runtime
///
/// Binds the TCP, UDP and hole sockets once at startup, runs the listeners
/// on them and describes this process to peers as a `Service`.

use crate::nat::{LocalNat, Nat};
use crate::network::{accept_loop, datagram_loop, ListenerContext};
use crate::peer::PeerSource;
use crate::transport::reuse;
use lurker_common::{Addr, LurkerConfig, LurkerError, Result, Service};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Discovered peers buffered before the registry picks them up
const SOURCE_QUEUE: usize = 256;

#[derive(Debug)]
struct Sockets {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    hole: Arc<UdpSocket>,
}

/// A bound lurker process
pub struct Lurker {
    config: LurkerConfig,

    /// Bound sockets, taken by `listen`
    sockets: Option<Sockets>,

    port_tcp: u16,
    port_udp: u16,
    port_hole: u16,

    nat: Arc<dyn Nat>,

    shutdown: watch::Sender<bool>,

    /// Listener tasks
    tasks: Vec<JoinHandle<()>>,
}

impl Lurker {
    /// Bind all three sockets from `config`. Must run inside a tokio runtime.
    pub fn bind(config: LurkerConfig) -> Result<Self> {
        let ip: IpAddr = config
            .listen_addr
            .parse()
            .map_err(|_| LurkerError::invalid_address(config.listen_addr.clone()))?;

        let tcp = reuse::bind_tcp_listener(SocketAddr::new(ip, config.tcp_port))?;
        let udp = reuse::bind_udp(SocketAddr::new(ip, config.udp_port))?;
        let hole = reuse::bind_udp(SocketAddr::new(ip, config.hole_port))?;

        let port_tcp = tcp.local_addr()?.port();
        let port_udp = udp.local_addr()?.port();
        let port_hole = hole.local_addr()?.port();

        info!(
            "Bound {} (tcp {}, udp {}, hole {})",
            ip, port_tcp, port_udp, port_hole
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            sockets: Some(Sockets {
                tcp,
                udp: Arc::new(udp),
                hole: Arc::new(hole),
            }),
            port_tcp,
            port_udp,
            port_hole,
            nat: Arc::new(LocalNat::new()),
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Replace the internal address discovery
    pub fn with_nat(mut self, nat: impl Nat + 'static) -> Self {
        self.nat = Arc::new(nat);
        self
    }

    pub fn config(&self) -> &LurkerConfig {
        &self.config
    }

    pub fn port_tcp(&self) -> u16 {
        self.port_tcp
    }

    pub fn port_udp(&self) -> u16 {
        self.port_udp
    }

    pub fn port_hole(&self) -> u16 {
        self.port_hole
    }

    /// Our service descriptor, advertising the bound ports
    pub fn local_service(&self, id: impl Into<String>) -> Result<Service> {
        let isp = self.nat.internal_address()?;
        Ok(Service::new(id, isp).with_ports(self.port_tcp, self.port_udp, self.port_hole))
    }

    /// Start accepting handshakes as `local`.
    ///
    /// Every peer that completes a handshake is delivered on the returned
    /// channel. Fails if called twice.
    pub fn listen(&mut self, local: Service) -> Result<mpsc::Receiver<PeerSource>> {
        let sockets = self
            .sockets
            .take()
            .ok_or_else(|| LurkerError::network("lurker is already listening"))?;

        info!("Lurker {} listening", local.id);

        let (sources, rx) = mpsc::channel(SOURCE_QUEUE);
        let ctx = ListenerContext {
            sources,
            local: Arc::new(local),
            handshake_timeout: self.config.handshake_timeout(),
            connect_timeout: self.config.connect_timeout(),
            keepalive_interval: self.config.keepalive_interval(),
            shutdown: self.shutdown.subscribe(),
        };

        self.tasks.push(tokio::spawn(accept_loop(sockets.tcp, ctx.clone())));
        self.tasks.push(tokio::spawn(datagram_loop(sockets.udp, ctx.clone())));
        self.tasks.push(tokio::spawn(datagram_loop(sockets.hole, ctx)));

        Ok(rx)
    }

    /// Source for an outbound attempt to `addr`.
    ///
    /// Both the advertised and the sending service are `local`, so the
    /// reverse dial leaves from our own listening ports.
    pub fn source_to(&self, addr: Addr, local: Arc<Service>) -> PeerSource {
        PeerSource::new(local.as_ref().clone(), addr, local)
            .with_timeout(self.config.connect_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop the listeners and any keep-alive loops
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Listener task ended abnormally: {}", e);
            }
        }

        info!("Lurker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Reachability, Source};
    use lurker_common::Protocol;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn loopback_nat() -> LocalNat {
        LocalNat::with_route_target(SocketAddr::new(LOCALHOST, 9))
    }

    fn ephemeral_config() -> LurkerConfig {
        LurkerConfig::new()
            .with_listen_addr("127.0.0.1")
            .with_tcp_port(0)
            .with_udp_port(0)
            .with_hole_port(0)
            .with_handshake_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_bind_reports_ports() {
        let lurker = Lurker::bind(ephemeral_config()).unwrap().with_nat(loopback_nat());

        assert_ne!(lurker.port_tcp(), 0);
        assert_ne!(lurker.port_udp(), 0);
        assert_ne!(lurker.port_hole(), 0);

        let service = lurker.local_service("me").unwrap();
        assert_eq!(service.isp, LOCALHOST);
        assert_eq!(service.port_tcp, lurker.port_tcp());
        assert_eq!(service.port_hole, lurker.port_hole());
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_listen_addr() {
        let config = ephemeral_config().with_listen_addr("not-an-ip");
        assert!(matches!(
            Lurker::bind(config),
            Err(LurkerError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let mut lurker = Lurker::bind(ephemeral_config()).unwrap().with_nat(loopback_nat());
        let local = lurker.local_service("me").unwrap();

        let _rx = lurker.listen(local.clone()).unwrap();
        assert!(lurker.listen(local).is_err());

        lurker.stop().await;
        assert!(!lurker.is_running());
    }

    #[tokio::test]
    async fn test_two_lurkers_handshake() {
        let mut alpha = Lurker::bind(ephemeral_config()).unwrap().with_nat(loopback_nat());
        let alpha_service = alpha.local_service("alpha").unwrap();
        let mut alpha_sources = alpha.listen(alpha_service).unwrap();

        let mut beta = Lurker::bind(ephemeral_config()).unwrap().with_nat(loopback_nat());
        let beta_service = Arc::new(beta.local_service("beta").unwrap());
        let _beta_sources = beta.listen(beta_service.as_ref().clone()).unwrap();

        // dial from ephemeral ports; both processes share one host here
        let target = Service::new("alpha", LOCALHOST).with_ports(0, 0, 0);
        let source = PeerSource::new(target, Addr::tcp(LOCALHOST, alpha.port_tcp()), beta_service)
            .with_hole_addr(Addr::new(Protocol::Udp, LOCALHOST, alpha.port_hole()))
            .with_timeout(Duration::from_secs(2));

        let outcome = source.try_connect().await;
        assert_eq!(outcome.reachability(), Reachability::Both);
        assert!(outcome.into_result().is_ok());

        for _ in 0..2 {
            let discovered = tokio::time::timeout(Duration::from_secs(2), alpha_sources.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(discovered.id(), "beta");
            assert_eq!(discovered.addr().port, beta.port_tcp());
            assert_eq!(discovered.hole_addr().port, beta.port_hole());
        }

        alpha.stop().await;
        beta.stop().await;
    }

    #[tokio::test]
    async fn test_idle_client_closed_after_sub_second_timeout() {
        let config = ephemeral_config().with_handshake_timeout(Duration::from_millis(300));
        let mut lurker = Lurker::bind(config).unwrap().with_nat(loopback_nat());
        let local = lurker.local_service("me").unwrap();
        let _sources = lurker.listen(local).unwrap();

        let mut idle = TcpStream::connect((LOCALHOST, lurker.port_tcp())).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(3), idle.read(&mut buf))
            .await
            .expect("idle connection must be dropped at the handshake deadline");
        assert_eq!(read.unwrap(), 0);

        lurker.stop().await;
    }
}
