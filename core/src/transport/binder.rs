/// Keeps the transport in step with the session
///
/// Every identity change reconnects with the new credential; every sign-out
/// disconnects. Changes are handled in order, one at a time.
use crate::session::SessionState;
use crate::transport::channel::TransportChannel;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Start following session changes. Subscribes before returning, so call it
/// ahead of `SessionState::initialize` to see the initial resolution.
pub fn bind(session: &SessionState, transport: Arc<TransportChannel>) -> JoinHandle<()> {
    let mut changes = session.changes();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            match change {
                Some(identity) => {
                    debug!("Session is now {}, reconnecting transport", identity.id);
                    transport.disconnect().await;
                    if let Err(e) = transport.connect().await {
                        error!("Transport connect for user {} failed: {}", identity.id, e);
                    }
                }
                None => {
                    debug!("Session ended, disconnecting transport");
                    transport.disconnect().await;
                }
            }
        }
    })
}
