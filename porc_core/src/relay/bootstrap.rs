/*! Relay side of the bootstrap handshake.

Every accepted connection walks through these states:

```text
Accepted --secure handshake--> SecureChannelEstablished
         --PubKeyRequest-----> KeyRequested
         --PubKeyResponse----> KeySent
         --SymKeyResponse----> SymKeyAwaited
         --key opened--------> Bootstrapped
```

Any failure moves to `Failed` and closes the connection. Nothing is
registered before the hop key is opened; if the final `BootstrapResponse`
can't be delivered the registered sessions are removed again.
*/

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use porc_binary_io::*;
use porc_crypto::*;
use porc_packet::bootstrap::*;
use porc_packet::relay::CircuitId;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::relay::client::SecureStream;
use crate::relay::codec::{to_record, Codec};
use crate::relay::errors::{BootstrapError, SendRecordError};
use crate::relay::handshake::make_server_handshake;
use crate::relay::server::RelayContext;
use crate::relay::session::{Sessions, TransportId, TransportSession};

/// Time allowed for a connection to finish the handshake up to the opened
/// hop key.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// State of a connection in the bootstrap handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapState {
    /// Connection accepted, nothing exchanged yet.
    Accepted,
    /// Secured transport is up.
    SecureChannelEstablished,
    /// Valid public key request received.
    KeyRequested,
    /// Public key sent to the client.
    KeySent,
    /// Symmetric key response received, the hop key is being opened.
    SymKeyAwaited,
    /// Sessions registered and announced to the client.
    Bootstrapped,
    /// Handshake failed, connection closed.
    Failed,
}

/// Outcome of a successful negotiation, not yet registered.
pub struct Negotiated {
    /// Secured connection.
    pub stream: SecureStream,
    /// Long-term PK of the peer.
    pub peer_pk: PublicKey,
    /// Circuit id of the previous relay, if the peer is a relay.
    pub predecessor: Option<CircuitId>,
    /// Hop key chosen by the client.
    pub key: LayerKey,
}

struct Bootstrap<'a> {
    context: &'a RelayContext,
    state: BootstrapState,
}

impl<'a> Bootstrap<'a> {
    fn new(context: &'a RelayContext) -> Self {
        Bootstrap {
            context,
            state: BootstrapState::Accepted,
        }
    }

    fn advance(&mut self, state: BootstrapState) {
        trace!("Bootstrap state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    async fn read_record(&self, stream: &mut SecureStream, expected: usize) -> Result<Vec<u8>, BootstrapError> {
        let state = self.state;
        match stream.next().await {
            None => Err(BootstrapError::Closed { state }),
            Some(Err(error)) => Err(BootstrapError::Read { state, error }),
            Some(Ok(record)) if record.len() != expected => Err(BootstrapError::RecordSize {
                state,
                expected,
                actual: record.len(),
            }),
            Some(Ok(record)) => Ok(record),
        }
    }

    async fn send_packet<P: ToBytes>(&self, stream: &mut SecureStream, packet: &P) -> Result<(), BootstrapError> {
        let state = self.state;
        let record = to_record(packet)
            .map_err(|error| BootstrapError::Send { state, error })?;
        stream.send(record).await
            .map_err(|error| BootstrapError::Send { state, error })
    }

    async fn negotiate(&mut self, stream: TcpStream) -> Result<Negotiated, BootstrapError> {
        let (stream, channel, peer_pk) = make_server_handshake(stream, self.context.sk()).await
            .map_err(BootstrapError::SecureHandshake)?;
        let mut stream = Framed::new(stream, Codec::new(channel));
        self.advance(BootstrapState::SecureChannelEstablished);

        let record = self.read_record(&mut stream, PUB_KEY_REQUEST_SIZE).await?;
        if record[0] != PUB_KEY_ASK {
            return Err(BootstrapError::UnknownCommand(record[0]))
        }
        let (_, request) = PubKeyRequest::from_bytes(&record)
            .map_err(|_| BootstrapError::Malformed { state: self.state })?;
        self.advance(BootstrapState::KeyRequested);

        let response = PubKeyResponse {
            status: Status::Success,
            pk: self.context.pk().clone(),
        };
        self.send_packet(&mut stream, &response).await?;
        self.advance(BootstrapState::KeySent);

        let record = self.read_record(&mut stream, SYM_KEY_RESPONSE_SIZE).await?;
        let (_, response) = SymKeyResponse::from_bytes(&record)
            .map_err(|_| BootstrapError::Malformed { state: self.state })?;
        if response.status != Status::Success {
            return Err(BootstrapError::ClientStatus(response.status))
        }
        self.advance(BootstrapState::SymKeyAwaited);

        let key = open_sealed_key(self.context.sk(), &response.sealed_key)
            .map_err(BootstrapError::OpenKey)?;

        Ok(Negotiated {
            stream,
            peer_pk,
            predecessor: request.predecessor,
            key,
        })
    }

    async fn run(mut self, stream: TcpStream) -> Result<Negotiated, BootstrapError> {
        match self.negotiate(stream).await {
            Ok(negotiated) => Ok(negotiated),
            Err(e) => {
                self.advance(BootstrapState::Failed);
                Err(e)
            },
        }
    }
}

/// Run the bootstrap handshake on an accepted connection up to the opened
/// hop key.
pub async fn negotiate(stream: TcpStream, context: &RelayContext) -> Result<Negotiated, BootstrapError> {
    timeout(BOOTSTRAP_TIMEOUT, Bootstrap::new(context).run(stream)).await
        .map_err(|_| BootstrapError::Timeout)?
}

/// Register the sessions of a negotiated connection and tell the client its
/// circuit id. Rolls the registration back if the client can't be told.
pub async fn register(negotiated: Negotiated, sessions: &Sessions) -> Result<(TransportId, CircuitId), BootstrapError> {
    let Negotiated { stream, peer_pk, predecessor, key } = negotiated;
    let transport = TransportSession::from_framed(stream, peer_pk)
        .map_err(BootstrapError::Register)?;
    let outbound = transport.outbound();

    let (transport_id, circuit_id) = sessions.insert_bootstrapped(transport, predecessor, key).await;

    let result = match to_record(&BootstrapResponse { circuit_id }) {
        Ok(record) => outbound.lock().await.send_record(record).await,
        Err(error) => Err(SendRecordError::Encode(error)),
    };
    if let Err(error) = result {
        sessions.close_transport(transport_id).await;
        return Err(BootstrapError::Acknowledge(error))
    }

    trace!("Bootstrap state {:?} -> {:?}", BootstrapState::SymKeyAwaited, BootstrapState::Bootstrapped);
    Ok((transport_id, circuit_id))
}

/// Bootstrap an accepted connection into a transport and a circuit session.
pub async fn bootstrap(stream: TcpStream, context: &RelayContext, sessions: &Sessions) -> Result<(TransportId, CircuitId), BootstrapError> {
    let negotiated = negotiate(stream, context).await?;
    register(negotiated, sessions).await
}
