pub mod nat;
pub mod network;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use nat::{LocalNat, Nat};
pub use node::Lurker;
pub use protocol::*;

// Re-export network types
pub use network::{Connector, HandshakeResponder, ListenerContext};

// Re-export peer types
pub use peer::{
    ConnectOutcome, PeerRegistry, PeerSource, PeerState, PeerStatus, Reachability,
    RegistryStats, Source,
};

// Re-export transport types
pub use transport::{FrameTransport, TcpFrames, UdpFrames};
