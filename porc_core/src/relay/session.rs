/*! Sessions of a relay and the three registries that own them.

A relay tracks three kinds of sessions:

- a [`TransportSession`] per secured connection, to a client, to a previous
  relay or to the next relay of a circuit;
- a [`CircuitSession`] per bootstrapped connection, holding the hop key and
  the routing role of this relay on the circuit;
- a [`DestinationSession`] per connection opened by a final hop to the
  circuit's destination.

[`Sessions`] keeps one registry per kind. Locks are always taken in the
order transports, circuits, destinations and never held across socket I/O.
*/

use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use porc_crypto::*;
use porc_packet::relay::{CircuitId, MAX_ENC_PACKET_SIZE};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::relay::codec::{Codec, DecodeError};
use crate::relay::errors::SendRecordError;
use crate::relay::registry::Registry;

/// Time allowed to write one record or one destination chunk.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Amount of buffer space reserved before each read from a transport.
const READ_BUF_SIZE: usize = 8 * MAX_ENC_PACKET_SIZE;

/// Id of a [`TransportSession`], local to this relay.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransportId(NonZeroU32);

impl From<NonZeroU32> for TransportId {
    fn from(id: NonZeroU32) -> Self {
        TransportId(id)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a [`DestinationSession`], local to this relay.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DestinationId(NonZeroU32);

impl From<NonZeroU32> for DestinationId {
    fn from(id: NonZeroU32) -> Self {
        DestinationId(id)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Records read from a transport in one go.
#[derive(Debug, Default)]
pub struct Received {
    /// Complete decrypted records in arrival order.
    pub records: Vec<Vec<u8>>,
    /// The peer closed its side of the connection.
    pub closed: bool,
}

/// Read side of a secured connection.
pub struct Inbound {
    socket: Arc<OwnedReadHalf>,
    buf: BytesMut,
    codec: Codec,
}

impl Inbound {
    /// Read what the socket has without waiting and decode every complete
    /// record. Incomplete data stays buffered until the next call.
    pub fn read_records(&mut self) -> Result<Received, DecodeError> {
        let mut received = Received::default();

        self.buf.reserve(READ_BUF_SIZE);
        match self.socket.try_read_buf(&mut self.buf) {
            Ok(0) => received.closed = true,
            Ok(_) => {},
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {},
            Err(e) => return Err(DecodeError::Io(e)),
        }

        while let Some(record) = self.codec.decode(&mut self.buf)? {
            received.records.push(record);
        }

        Ok(received)
    }
}

/// Write side of a secured connection.
pub struct Outbound {
    socket: OwnedWriteHalf,
    buf: BytesMut,
    codec: Codec,
}

impl Outbound {
    /// Encrypt and write one record.
    pub async fn send_record(&mut self, record: Vec<u8>) -> Result<(), SendRecordError> {
        self.buf.clear();
        self.codec.encode(record, &mut self.buf)
            .map_err(SendRecordError::Encode)?;
        timeout(SEND_TIMEOUT, self.socket.write_all(&self.buf)).await
            .map_err(|_| SendRecordError::Timeout)?
            .map_err(SendRecordError::Io)
    }
}

/// Secured connection to a peer, either a client, a previous relay or the
/// next relay of a circuit.
pub struct TransportSession {
    peer_pk: PublicKey,
    addr: SocketAddr,
    readiness: Arc<OwnedReadHalf>,
    inbound: Arc<Mutex<Inbound>>,
    outbound: Arc<Mutex<Outbound>>,
}

impl TransportSession {
    /// Split an established secured connection into its read and write sides.
    /// `read_buf` holds bytes that were already read past the handshake.
    pub fn new(stream: TcpStream, codec: Codec, read_buf: BytesMut, peer_pk: PublicKey) -> Result<TransportSession, IoError> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let reader = Arc::new(reader);

        let inbound = Inbound {
            socket: reader.clone(),
            buf: read_buf,
            codec: codec.clone(),
        };
        let outbound = Outbound {
            socket: writer,
            buf: BytesMut::new(),
            codec,
        };

        Ok(TransportSession {
            peer_pk,
            addr,
            readiness: reader,
            inbound: Arc::new(Mutex::new(inbound)),
            outbound: Arc::new(Mutex::new(outbound)),
        })
    }

    /// Take over a connection that was driven through `Framed` so far.
    pub fn from_framed(framed: Framed<TcpStream, Codec>, peer_pk: PublicKey) -> Result<TransportSession, IoError> {
        let parts = framed.into_parts();
        TransportSession::new(parts.io, parts.codec, parts.read_buf, peer_pk)
    }

    /// Long-term PK the peer presented in the handshake.
    pub fn peer_pk(&self) -> &PublicKey {
        &self.peer_pk
    }

    /// Address of the peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Read side of the connection.
    pub fn inbound(&self) -> Arc<Mutex<Inbound>> {
        self.inbound.clone()
    }

    /// Write side of the connection.
    pub fn outbound(&self) -> Arc<Mutex<Outbound>> {
        self.outbound.clone()
    }
}

/// Routing role of this relay on a circuit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HopRole {
    /// Last relay of the circuit. Data cells go to the destination, which is
    /// connected on first delivery.
    Final {
        /// Destination connection, if opened.
        destination: Option<DestinationId>,
    },
    /// Last relay of the circuit while it connects the next relay.
    Extending,
    /// Relay in the middle of the circuit.
    Intermediate {
        /// Connection to the next relay.
        downstream_transport: TransportId,
        /// Id the next relay assigned to the circuit.
        downstream_circuit: CircuitId,
    },
}

/// One hop of a circuit as seen by this relay.
pub struct CircuitSession {
    predecessor: Option<CircuitId>,
    upstream_transport: TransportId,
    role: HopRole,
    key: LayerKey,
}

impl CircuitSession {
    /// Create a final hop without destination.
    pub fn new(predecessor: Option<CircuitId>, upstream_transport: TransportId, key: LayerKey) -> CircuitSession {
        CircuitSession {
            predecessor,
            upstream_transport,
            role: HopRole::Final { destination: None },
            key,
        }
    }

    /// Id of the circuit on the previous relay, `None` when the upstream peer
    /// is the client.
    pub fn predecessor(&self) -> Option<CircuitId> {
        self.predecessor
    }

    /// Connection to the previous relay or the client.
    pub fn upstream_transport(&self) -> TransportId {
        self.upstream_transport
    }

    /// Id the upstream peer knows the circuit by.
    pub fn upstream_circuit_id(&self, own_id: CircuitId) -> CircuitId {
        self.predecessor.unwrap_or(own_id)
    }

    /// Connection to the next relay, if any.
    pub fn downstream_transport(&self) -> Option<TransportId> {
        match self.role {
            HopRole::Intermediate { downstream_transport, .. } => Some(downstream_transport),
            _ => None,
        }
    }

    /// Destination connection, if any.
    pub fn destination(&self) -> Option<DestinationId> {
        match self.role {
            HopRole::Final { destination } => destination,
            _ => None,
        }
    }

    /// Routing role of this relay on the circuit.
    pub fn role(&self) -> HopRole {
        self.role
    }

    /// Check if this relay is the last hop.
    pub fn is_final(&self) -> bool {
        matches!(self.role, HopRole::Final { .. })
    }

    /// Hop key shared with the client.
    pub fn key(&self) -> &LayerKey {
        &self.key
    }

    /// Switch a final hop without destination to extending.
    pub fn start_extending(&mut self) -> bool {
        match self.role {
            HopRole::Final { destination: None } => {
                self.role = HopRole::Extending;
                true
            },
            _ => false,
        }
    }

    /// Give up extending and become a final hop again.
    pub fn cancel_extending(&mut self) {
        if self.role == HopRole::Extending {
            self.role = HopRole::Final { destination: None };
        }
    }

    /// Finish extending by linking the next relay.
    pub fn link_downstream(&mut self, downstream_transport: TransportId, downstream_circuit: CircuitId) -> bool {
        match self.role {
            HopRole::Extending => {
                self.role = HopRole::Intermediate { downstream_transport, downstream_circuit };
                true
            },
            _ => false,
        }
    }

    fn references_transport(&self, id: TransportId) -> bool {
        self.upstream_transport == id || self.downstream_transport() == Some(id)
    }
}

/// Connection from a final hop to the circuit's destination.
pub struct DestinationSession {
    circuit_id: CircuitId,
    addr: SocketAddr,
    reader: Arc<OwnedReadHalf>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl DestinationSession {
    /// Wrap a connected destination stream.
    pub fn new(circuit_id: CircuitId, stream: TcpStream) -> Result<DestinationSession, IoError> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(DestinationSession {
            circuit_id,
            addr,
            reader: Arc::new(reader),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    /// Circuit the destination belongs to.
    pub fn circuit_id(&self) -> CircuitId {
        self.circuit_id
    }

    /// Address of the destination.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Read side of the connection.
    pub fn reader(&self) -> Arc<OwnedReadHalf> {
        self.reader.clone()
    }

    /// Write side of the connection.
    pub fn writer(&self) -> Arc<Mutex<OwnedWriteHalf>> {
        self.writer.clone()
    }
}

/// Session whose socket is watched for readability.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Watched {
    /// A transport session.
    Transport(TransportId),
    /// A destination session.
    Destination(DestinationId),
}

/// The three session registries shared by the acceptor and the forwarding loop.
#[derive(Clone, Default)]
pub struct Sessions {
    transports: Arc<RwLock<Registry<TransportId, TransportSession>>>,
    circuits: Arc<RwLock<Registry<CircuitId, CircuitSession>>>,
    destinations: Arc<RwLock<Registry<DestinationId, DestinationSession>>>,
}

impl Sessions {
    /// Create empty registries.
    pub fn new() -> Sessions {
        Sessions::default()
    }

    /// Register a freshly bootstrapped connection together with its circuit.
    pub async fn insert_bootstrapped(
        &self,
        transport: TransportSession,
        predecessor: Option<CircuitId>,
        key: LayerKey,
    ) -> (TransportId, CircuitId) {
        let mut transports = self.transports.write().await;
        let mut circuits = self.circuits.write().await;
        let transport_id = transports.insert(transport);
        let circuit_id = circuits.insert(CircuitSession::new(predecessor, transport_id, key));
        (transport_id, circuit_id)
    }

    /// Register a connection that is not tied to a new circuit.
    pub async fn insert_transport(&self, transport: TransportSession) -> TransportId {
        self.transports.write().await.insert(transport)
    }

    /// Attach a destination to a final hop. Returns `None` and drops the
    /// session if the circuit is gone or already has a destination.
    pub async fn insert_destination(&self, destination: DestinationSession) -> Option<DestinationId> {
        let mut circuits = self.circuits.write().await;
        let mut destinations = self.destinations.write().await;
        let circuit = circuits.get_mut(destination.circuit_id())?;
        if circuit.role != (HopRole::Final { destination: None }) {
            return None;
        }
        let destination_id = destinations.insert(destination);
        circuit.role = HopRole::Final { destination: Some(destination_id) };
        Some(destination_id)
    }

    /// Number of live transport sessions.
    pub async fn transports_count(&self) -> usize {
        self.transports.read().await.len()
    }

    /// Ids of live transport sessions.
    pub async fn transport_ids(&self) -> Vec<TransportId> {
        self.transports.read().await.ids()
    }

    /// Ids of live circuit sessions.
    pub async fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.read().await.ids()
    }

    /// Ids of live destination sessions.
    pub async fn destination_ids(&self) -> Vec<DestinationId> {
        self.destinations.read().await.ids()
    }

    /// Read side of a transport.
    pub async fn inbound(&self, id: TransportId) -> Option<Arc<Mutex<Inbound>>> {
        self.transports.read().await.get(id).map(TransportSession::inbound)
    }

    /// Write side of a transport.
    pub async fn outbound(&self, id: TransportId) -> Option<Arc<Mutex<Outbound>>> {
        self.transports.read().await.get(id).map(TransportSession::outbound)
    }

    /// Circuit and read side of a destination.
    pub async fn destination_reader(&self, id: DestinationId) -> Option<(CircuitId, Arc<OwnedReadHalf>)> {
        self.destinations.read().await.get(id).map(|d| (d.circuit_id(), d.reader()))
    }

    /// Write side of a destination.
    pub async fn destination_writer(&self, id: DestinationId) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
        self.destinations.read().await.get(id).map(DestinationSession::writer)
    }

    /// Run `f` on a circuit. `None` if there is no such circuit.
    pub async fn with_circuit<R, F: FnOnce(&CircuitSession) -> R>(&self, id: CircuitId, f: F) -> Option<R> {
        self.circuits.read().await.get(id).map(f)
    }

    /// Run `f` on a mutable circuit. `None` if there is no such circuit.
    pub async fn with_circuit_mut<R, F: FnOnce(&mut CircuitSession) -> R>(&self, id: CircuitId, f: F) -> Option<R> {
        self.circuits.write().await.get_mut(id).map(f)
    }

    /// Sockets to watch for readability: every transport and destination.
    pub async fn readiness_set(&self) -> Vec<(Watched, Arc<OwnedReadHalf>)> {
        let transports = self.transports.read().await;
        let destinations = self.destinations.read().await;
        transports.iter()
            .map(|(id, t)| (Watched::Transport(id), t.readiness.clone()))
            .chain(destinations.iter().map(|(id, d)| (Watched::Destination(id), d.reader())))
            .collect()
    }

    /// Close a circuit together with its transports and destination.
    pub async fn close_circuit(&self, id: CircuitId) -> bool {
        let mut transports = self.transports.write().await;
        let mut circuits = self.circuits.write().await;
        let mut destinations = self.destinations.write().await;

        let circuit = match circuits.remove(id) {
            Some(circuit) => circuit,
            None => return false,
        };
        transports.remove(circuit.upstream_transport);
        match circuit.role {
            HopRole::Final { destination: Some(destination) } => {
                destinations.remove(destination);
            },
            HopRole::Intermediate { downstream_transport, .. } => {
                transports.remove(downstream_transport);
            },
            _ => {},
        }
        true
    }

    /// Close a transport and every circuit that references it.
    pub async fn close_transport(&self, id: TransportId) -> bool {
        let affected = self.circuits.read().await.iter()
            .filter(|(_, circuit)| circuit.references_transport(id))
            .map(|(circuit_id, _)| circuit_id)
            .collect::<Vec<_>>();

        let mut closed = false;
        for circuit_id in affected {
            closed |= self.close_circuit(circuit_id).await;
        }
        closed | self.transports.write().await.remove(id).is_some()
    }

    /// Close a destination. Its circuit stays live and reconnects on the
    /// next delivery.
    pub async fn close_destination(&self, id: DestinationId) -> bool {
        let mut circuits = self.circuits.write().await;
        let mut destinations = self.destinations.write().await;

        let destination = match destinations.remove(id) {
            Some(destination) => destination,
            None => return false,
        };
        if let Some(circuit) = circuits.get_mut(destination.circuit_id()) {
            if circuit.destination() == Some(id) {
                circuit.role = HopRole::Final { destination: None };
            }
        }
        true
    }

    /// Close every session.
    pub async fn close_all(&self) {
        let mut transports = self.transports.write().await;
        let mut circuits = self.circuits.write().await;
        let mut destinations = self.destinations.write().await;
        destinations.clear();
        circuits.clear();
        transports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::relay::secure::*;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn codecs_pair() -> (Codec, Codec) {
        let alice_session = Session::random();
        let bob_session = Session::random();
        let alice_channel = Channel::new(&alice_session, bob_session.pk(), bob_session.nonce());
        let bob_channel = Channel::new(&bob_session, alice_session.pk(), alice_session.nonce());
        (Codec::new(alice_channel), Codec::new(bob_channel))
    }

    async fn transport_pair() -> (TransportSession, TransportSession) {
        let (alice_stream, bob_stream) = tcp_pair().await;
        let (alice_codec, bob_codec) = codecs_pair();
        let pk = SecretKey::generate(&mut rand::thread_rng()).public_key();
        let alice = TransportSession::new(alice_stream, alice_codec, BytesMut::new(), pk.clone()).unwrap();
        let bob = TransportSession::new(bob_stream, bob_codec, BytesMut::new(), pk).unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn transport_send_read_records() {
        let (alice, bob) = transport_pair().await;

        alice.outbound().lock().await.send_record(vec![1, 2, 3]).await.unwrap();
        alice.outbound().lock().await.send_record(vec![4]).await.unwrap();

        let mut records = Vec::new();
        while records.len() < 2 {
            bob.readiness.readable().await.unwrap();
            let received = bob.inbound().lock().await.read_records().unwrap();
            assert!(!received.closed);
            records.extend(received.records);
        }
        assert_eq!(records, vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test]
    async fn transport_read_closed() {
        let (alice, bob) = transport_pair().await;
        drop(alice);

        loop {
            bob.readiness.readable().await.unwrap();
            let received = bob.inbound().lock().await.read_records().unwrap();
            if received.closed {
                break;
            }
        }
    }

    async fn sessions_with_circuit() -> (Sessions, TransportSession, TransportId, CircuitId) {
        let sessions = Sessions::new();
        let (alice, bob) = transport_pair().await;
        let (transport_id, circuit_id) = sessions.insert_bootstrapped(bob, None, LayerKey::generate()).await;
        (sessions, alice, transport_id, circuit_id)
    }

    #[tokio::test]
    async fn insert_bootstrapped() {
        let sessions = Sessions::new();
        let (_alice, bob) = transport_pair().await;
        let predecessor = CircuitId::new(42);
        let key = LayerKey::generate();
        let (transport_id, circuit_id) = sessions.insert_bootstrapped(bob, predecessor, key.clone()).await;

        let (stored_predecessor, stored_transport, stored_key, is_final) = sessions.with_circuit(circuit_id, |c| {
            (c.predecessor(), c.upstream_transport(), c.key().clone(), c.is_final())
        }).await.unwrap();
        assert_eq!(stored_predecessor, predecessor);
        assert_eq!(stored_transport, transport_id);
        assert_eq!(stored_key, key);
        assert!(is_final);
        assert_eq!(sessions.transport_ids().await, vec![transport_id]);
    }

    #[tokio::test]
    async fn close_transport_closes_circuit() {
        let (sessions, _alice, transport_id, circuit_id) = sessions_with_circuit().await;

        assert!(sessions.close_transport(transport_id).await);
        assert!(sessions.circuit_ids().await.is_empty());
        assert!(sessions.transport_ids().await.is_empty());
        assert!(!sessions.close_transport(transport_id).await);
        assert!(!sessions.close_circuit(circuit_id).await);
    }

    #[tokio::test]
    async fn close_downstream_transport_closes_circuit() {
        let (sessions, _alice, upstream_id, circuit_id) = sessions_with_circuit().await;
        let (_carol, dave) = transport_pair().await;
        let downstream_id = sessions.insert_transport(dave).await;

        let extended = sessions.with_circuit_mut(circuit_id, |c| {
            c.start_extending() && c.link_downstream(downstream_id, CircuitId::new(7).unwrap())
        }).await;
        assert_eq!(extended, Some(true));

        assert!(sessions.close_transport(downstream_id).await);
        assert!(sessions.circuit_ids().await.is_empty());
        assert!(!sessions.transport_ids().await.contains(&upstream_id));
    }

    #[tokio::test]
    async fn destination_lifecycle() {
        let (sessions, _alice, transport_id, circuit_id) = sessions_with_circuit().await;
        let (dest_stream, _dest_peer) = tcp_pair().await;

        let destination_id = sessions.insert_destination(DestinationSession::new(circuit_id, dest_stream).unwrap())
            .await
            .unwrap();
        assert_eq!(sessions.with_circuit(circuit_id, CircuitSession::destination).await, Some(Some(destination_id)));

        // a second destination is refused
        let (other_stream, _other_peer) = tcp_pair().await;
        assert!(sessions.insert_destination(DestinationSession::new(circuit_id, other_stream).unwrap()).await.is_none());

        // closing the destination keeps the circuit
        assert!(sessions.close_destination(destination_id).await);
        assert_eq!(sessions.with_circuit(circuit_id, CircuitSession::destination).await, Some(None));
        assert_eq!(sessions.transport_ids().await, vec![transport_id]);
    }

    #[tokio::test]
    async fn close_circuit_closes_destination() {
        let (sessions, _alice, _transport_id, circuit_id) = sessions_with_circuit().await;
        let (dest_stream, mut dest_peer) = tcp_pair().await;
        sessions.insert_destination(DestinationSession::new(circuit_id, dest_stream).unwrap()).await.unwrap();

        assert!(sessions.close_circuit(circuit_id).await);
        assert!(sessions.destination_ids().await.is_empty());

        // destination peer sees EOF
        let mut buf = [0; 1];
        assert_eq!(dest_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn readiness_set_lists_all_sockets() {
        let (sessions, _alice, transport_id, circuit_id) = sessions_with_circuit().await;
        let (dest_stream, _dest_peer) = tcp_pair().await;
        let destination_id = sessions.insert_destination(DestinationSession::new(circuit_id, dest_stream).unwrap())
            .await
            .unwrap();

        let watched = sessions.readiness_set().await.into_iter().map(|(w, _)| w).collect::<Vec<_>>();
        assert_eq!(watched, vec![Watched::Transport(transport_id), Watched::Destination(destination_id)]);
    }

    #[test]
    fn hop_role_transitions() {
        let transport_id = TransportId::from(NonZeroU32::new(1).unwrap());
        let mut circuit = CircuitSession::new(None, transport_id, LayerKey::generate());
        let own_id = CircuitId::new(5).unwrap();
        assert_eq!(circuit.upstream_circuit_id(own_id), own_id);

        assert!(!circuit.link_downstream(transport_id, own_id));
        assert!(circuit.start_extending());
        assert!(!circuit.is_final());
        assert!(!circuit.start_extending());
        circuit.cancel_extending();
        assert!(circuit.is_final());

        assert!(circuit.start_extending());
        assert!(circuit.link_downstream(transport_id, own_id));
        assert_eq!(circuit.downstream_transport(), Some(transport_id));
        assert_eq!(circuit.role(), HopRole::Intermediate { downstream_transport: transport_id, downstream_circuit: own_id });
    }
}
