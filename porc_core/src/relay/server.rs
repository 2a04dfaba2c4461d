/*! Relay node assembled from the acceptor and the forwarding loop.
*/

use std::sync::Arc;

use futures::channel::mpsc;
use porc_crypto::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::relay::acceptor::Acceptor;
use crate::relay::destination::DestinationConnector;
use crate::relay::errors::RunError;
use crate::relay::forwarding::ForwardingLoop;
use crate::relay::session::Sessions;

/// Default maximum number of transport sessions.
pub const DEFAULT_CONNECTIONS_LIMIT: usize = 512;

/// Long-term identity and limits of a relay, shared read-only by all of its
/// tasks.
pub struct RelayContext {
    pk: PublicKey,
    sk: SecretKey,
    connections_limit: usize,
}

impl RelayContext {
    /// Create a context for the relay with secret key `sk`.
    pub fn new(sk: SecretKey) -> RelayContext {
        RelayContext {
            pk: sk.public_key(),
            sk,
            connections_limit: DEFAULT_CONNECTIONS_LIMIT,
        }
    }

    /// Set the maximum number of transport sessions.
    pub fn with_connections_limit(mut self, connections_limit: usize) -> RelayContext {
        self.connections_limit = connections_limit;
        self
    }

    /// Public key handed to clients and used for the secured transport.
    pub fn pk(&self) -> &PublicKey {
        &self.pk
    }

    /// Secret key for the secured transport and for opening hop keys.
    pub fn sk(&self) -> &SecretKey {
        &self.sk
    }

    /// Maximum number of transport sessions.
    pub fn connections_limit(&self) -> usize {
        self.connections_limit
    }
}

/// Onion-routing relay node.
pub struct Relay {
    context: Arc<RelayContext>,
    sessions: Sessions,
    connector: Arc<dyn DestinationConnector>,
}

impl Relay {
    /// Create a relay. `connector` opens destination connections for
    /// circuits ending here.
    pub fn new(context: RelayContext, connector: Arc<dyn DestinationConnector>) -> Relay {
        Relay {
            context: Arc::new(context),
            sessions: Sessions::new(),
            connector,
        }
    }

    /// Identity of the relay.
    pub fn context(&self) -> &Arc<RelayContext> {
        &self.context
    }

    /// Session registries of the relay.
    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Accept connections on `listener` and forward frames until `shutdown`
    /// is cancelled or the listener fails. All sessions are closed on return.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), RunError> {
        let (events_tx, events_rx) = mpsc::unbounded();

        let acceptor = Acceptor::new(self.context.clone(), self.sessions.clone(), events_tx.clone());
        let forwarding = ForwardingLoop::new(
            self.context.clone(),
            self.sessions.clone(),
            self.connector.clone(),
            events_tx,
            events_rx,
        );

        let loop_shutdown = shutdown.child_token();
        // stops the loop if this future is dropped before it finishes
        let _loop_guard = loop_shutdown.clone().drop_guard();
        let forwarding = tokio::spawn(forwarding.run(loop_shutdown.clone()));

        let res = acceptor.run(listener, shutdown.clone()).await;
        // listener failure stops forwarding as well
        loop_shutdown.cancel();

        if let Err(e) = forwarding.await {
            error!("Forwarding loop failed: {}", e);
            return res.and(Err(RunError::Forwarding(e)))
        }
        res
    }
}
