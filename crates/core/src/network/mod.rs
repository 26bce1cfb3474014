/// Inbound side of the lurker
///
/// Listeners accept TCP connections and demultiplex UDP datagrams, handing
/// each one to a `Connector` on its own task.

mod connector;
mod listener;

pub use connector::{Connector, HandshakeResponder};
pub use listener::{accept_loop, datagram_loop, ListenerContext};

use tokio::sync::watch;

/// Resolve once the flag is `true` or every sender is gone
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}
