/// Transport layer for Lurker
///
/// Provides frame-oriented access to TCP streams and UDP datagram sessions,
/// sockets that can dial out from an already listening port, and deadline
/// handling shared by the handshake code.

mod frame;
pub mod reuse;

pub use frame::{FrameTransport, TcpFrames, UdpFrames};

use lurker_common::{LurkerError, Result};
use std::future::Future;
use std::time::Duration;

/// Run `fut` under a deadline. There is no way to wait without one.
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LurkerError::Timeout),
    }
}
