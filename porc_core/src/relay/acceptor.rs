/*! Accepts connections and bootstraps them one at a time.
*/

use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use futures::channel::mpsc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::relay::bootstrap::bootstrap;
use crate::relay::errors::RunError;
use crate::relay::forwarding::LoopEvent;
use crate::relay::server::RelayContext;
use crate::relay::session::Sessions;

/// Accept errors caused by a single incoming connection.
fn is_connection_error(e: &IoError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

/// Turns accepted connections into registered sessions.
pub struct Acceptor {
    context: Arc<RelayContext>,
    sessions: Sessions,
    waker: mpsc::UnboundedSender<LoopEvent>,
}

impl Acceptor {
    /// Create an acceptor that wakes the forwarding loop through `waker`.
    pub fn new(context: Arc<RelayContext>, sessions: Sessions, waker: mpsc::UnboundedSender<LoopEvent>) -> Acceptor {
        Acceptor { context, sessions, waker }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let limit = self.context.connections_limit();
        if self.sessions.transports_count().await >= limit {
            warn!("Rejecting connection from {}: limit of {} connections reached", addr, limit);
            return;
        }

        debug!("A new connection from {}", addr);
        match bootstrap(stream, &self.context, &self.sessions).await {
            Ok((transport_id, circuit_id)) => {
                info!("Circuit {} bootstrapped with {} on transport {}", circuit_id, addr, transport_id);
                if self.waker.unbounded_send(LoopEvent::Wake).is_err() {
                    warn!("Forwarding loop is gone, circuit {} won't be served", circuit_id);
                }
            },
            Err(e) => {
                warn!("Bootstrap with {} failed in state {:?}: {}", addr, e.failed_at(), e);
            },
        }
    }

    /// Accept connections until `shutdown` is cancelled. Bootstraps are run
    /// one after another and end either registered or closed.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), RunError> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                },
                Err(e) => {
                    error!("Listener failed: {}", e);
                    return Err(RunError::Accept(e))
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                () = self.handle_connection(stream, addr) => {},
            }
        }

        info!("Acceptor stopped");
        Ok(())
    }
}
