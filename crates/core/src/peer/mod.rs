/// Outbound side of the lurker
///
/// Sources describe discovered peers and know how to reach them; the
/// registry makes sure each identity is attempted at most once.

mod registry;
mod source;

pub use registry::{PeerRegistry, PeerState, PeerStatus, RegistryStats};
pub use source::{initiate, ConnectOutcome, PeerSource, Reachability, Source};
