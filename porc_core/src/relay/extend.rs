/*! Extending a circuit by one hop.

When a final hop receives an `Extend` cell it connects the named relay and
runs the client side of the bootstrap handshake there, passing the sealed key
the client prepared and its own circuit id as predecessor. The new connection
becomes the circuit's downstream transport.
*/

use std::time::Duration;

use porc_crypto::*;
use porc_packet::cell::ExtendCell;
use porc_packet::relay::CircuitId;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::relay::client::{request_public_key, secure_connect, send_sealed_key};
use crate::relay::errors::{ClientError, ExtendError};
use crate::relay::server::RelayContext;
use crate::relay::session::TransportSession;

/// Time allowed to connect the next relay and bootstrap a hop on it.
pub const EXTEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Next hop of a circuit, ready to be registered.
pub struct ExtendedHop {
    /// Connection to the next relay.
    pub transport: TransportSession,
    /// Id the next relay assigned to the circuit.
    pub circuit_id: CircuitId,
}

async fn bootstrap_next_hop(context: &RelayContext, predecessor: CircuitId, cell: ExtendCell) -> Result<ExtendedHop, ExtendError> {
    let stream = TcpStream::connect(cell.addr).await
        .map_err(ExtendError::Connect)?;
    let mut stream = secure_connect(stream, context.pk(), context.sk(), &cell.relay_pk).await
        .map_err(ExtendError::Client)?;

    let pk = request_public_key(&mut stream, Some(predecessor)).await
        .map_err(ExtendError::Client)?;
    if pk != cell.relay_pk {
        return Err(ExtendError::Client(ClientError::UnexpectedKey))
    }
    let circuit_id = send_sealed_key(&mut stream, cell.sealed_key).await
        .map_err(ExtendError::Client)?;

    let transport = TransportSession::from_framed(stream, pk)
        .map_err(ExtendError::Register)?;
    Ok(ExtendedHop { transport, circuit_id })
}

/// Connect the relay named by `cell` and bootstrap the next hop of the
/// circuit this relay knows as `predecessor`.
pub async fn extend_circuit(context: &RelayContext, predecessor: CircuitId, cell: ExtendCell) -> Result<ExtendedHop, ExtendError> {
    timeout(EXTEND_TIMEOUT, bootstrap_next_hop(context, predecessor, cell)).await
        .map_err(|_| ExtendError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    use rand::thread_rng;
    use tokio::net::TcpListener;

    use crate::relay::bootstrap::bootstrap;
    use crate::relay::session::{CircuitSession, Sessions};

    #[tokio::test]
    async fn extend_to_relay() {
        let context = RelayContext::new(SecretKey::generate(&mut thread_rng()));
        let next_context = RelayContext::new(SecretKey::generate(&mut thread_rng()));
        let next_sessions = Sessions::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let key = LayerKey::generate();
        let cell = ExtendCell {
            addr,
            relay_pk: next_context.pk().clone(),
            sealed_key: seal_key(next_context.pk(), &key).unwrap(),
        };
        let predecessor = CircuitId::new(9).unwrap();

        let next_relay = async {
            let (stream, _) = listener.accept().await.unwrap();
            bootstrap(stream, &next_context, &next_sessions).await
        };
        let (next_res, res) = futures::join!(next_relay, extend_circuit(&context, predecessor, cell));
        let (_, next_circuit_id) = next_res.unwrap();
        let hop = res.unwrap();

        assert_eq!(hop.circuit_id, next_circuit_id);
        assert_eq!(hop.transport.peer_pk(), next_context.pk());
        let (stored_predecessor, stored_key) = next_sessions.with_circuit(next_circuit_id, |c: &CircuitSession| {
            (c.predecessor(), c.key().clone())
        }).await.unwrap();
        assert_eq!(stored_predecessor, Some(predecessor));
        assert_eq!(stored_key, key);
    }

    #[tokio::test]
    async fn extend_to_unreachable_relay() {
        let context = RelayContext::new(SecretKey::generate(&mut thread_rng()));

        // bind and drop to get a free port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);

        let relay_pk = SecretKey::generate(&mut thread_rng()).public_key();
        let cell = ExtendCell {
            addr,
            relay_pk: relay_pk.clone(),
            sealed_key: seal_key(&relay_pk, &LayerKey::generate()).unwrap(),
        };

        let res = extend_circuit(&context, CircuitId::new(1).unwrap(), cell).await;
        assert!(matches!(res, Err(ExtendError::Connect(_))));
    }
}
