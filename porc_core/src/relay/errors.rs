use std::io::Error as IoError;

use porc_binary_io::GenError;
use porc_crypto::{LayerError, OpenSealedKeyError, SealKeyError};
use porc_packet::bootstrap::Status;
use porc_packet::cell::MAX_CIRCUIT_HOPS;
use porc_packet::relay::{CircuitId, FrameError};
use thiserror::Error;
use tokio::task::JoinError;

use crate::relay::bootstrap::BootstrapState;
use crate::relay::codec::{DecodeError, EncodeError};
use crate::relay::session::{DestinationId, TransportId};

/// Error that can happen during the secured transport handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Connect to the relay error.
    #[error("Connect to the relay error: {:?}", _0)]
    Connect(IoError),
    /// Send handshake packet error.
    #[error("Send handshake packet error: {:?}", _0)]
    Send(IoError),
    /// Read handshake packet error.
    #[error("Read handshake packet error: {:?}", _0)]
    Read(IoError),
    /// Connection closed before the handshake packet arrived.
    #[error("Connection closed during the handshake")]
    Closed,
    /// Handshake payload can't be serialized.
    #[error("Serialize handshake payload error: {}", _0)]
    SerializePayload(String),
    /// Handshake payload can't be encrypted.
    #[error("Failed to encrypt handshake payload")]
    EncryptPayload,
    /// Handshake payload can't be decrypted.
    #[error("Failed to decrypt handshake payload")]
    DecryptPayload,
    /// Decrypted handshake payload can't be parsed.
    #[error("Failed to deserialize handshake payload")]
    DeserializePayload,
}

/// Error that can happen when writing a record to a transport.
#[derive(Debug, Error)]
pub enum SendRecordError {
    /// Record can't be encoded.
    #[error("Encode record error: {}", _0)]
    Encode(EncodeError),
    /// Write didn't finish in time.
    #[error("Write record timed out")]
    Timeout,
    /// Socket error.
    #[error("Write record error: {:?}", _0)]
    Io(IoError),
}

/// Error that can happen while bootstrapping an accepted connection.
///
/// Every failure closes the connection and leaves the registries untouched.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Secured transport handshake failed.
    #[error("Secure handshake error: {}", _0)]
    SecureHandshake(HandshakeError),
    /// Bootstrap didn't finish in time.
    #[error("Bootstrap timed out")]
    Timeout,
    /// Connection closed before the expected record arrived.
    #[error("Connection closed in state {:?}", state)]
    Closed {
        /// State the bootstrap was in.
        state: BootstrapState,
    },
    /// Record can't be read.
    #[error("Read record error in state {:?}: {}", state, error)]
    Read {
        /// State the bootstrap was in.
        state: BootstrapState,
        /// Decoding error.
        error: DecodeError,
    },
    /// Record has unexpected size.
    #[error("Record of {} bytes received in state {:?}, {} bytes expected", actual, state, expected)]
    RecordSize {
        /// State the bootstrap was in.
        state: BootstrapState,
        /// Size required in this state.
        expected: usize,
        /// Size of the received record.
        actual: usize,
    },
    /// Public key request carries an unknown command byte.
    #[error("Unknown command {:#04x}", _0)]
    UnknownCommand(u8),
    /// Record can't be parsed.
    #[error("Malformed record in state {:?}", state)]
    Malformed {
        /// State the bootstrap was in.
        state: BootstrapState,
    },
    /// Record can't be sent.
    #[error("Send record error in state {:?}: {}", state, error)]
    Send {
        /// State the bootstrap was in.
        state: BootstrapState,
        /// Encoding error.
        error: EncodeError,
    },
    /// Client reported failure in its symmetric key response.
    #[error("Client reported {:?} status", _0)]
    ClientStatus(Status),
    /// Sealed hop key can't be opened with the relay's secret key.
    #[error("Open sealed key error: {}", _0)]
    OpenKey(OpenSealedKeyError),
    /// Connection can't be turned into a transport session.
    #[error("Register transport error: {:?}", _0)]
    Register(IoError),
    /// Bootstrap response can't be sent, the sessions were rolled back.
    #[error("Send bootstrap response error: {}", _0)]
    Acknowledge(SendRecordError),
}

impl BootstrapError {
    /// State the bootstrap failed in.
    pub fn failed_at(&self) -> BootstrapState {
        match *self {
            BootstrapError::SecureHandshake(_) => BootstrapState::Accepted,
            BootstrapError::Timeout => BootstrapState::Failed,
            BootstrapError::Closed { state } |
            BootstrapError::Read { state, .. } |
            BootstrapError::RecordSize { state, .. } |
            BootstrapError::Malformed { state } |
            BootstrapError::Send { state, .. } => state,
            BootstrapError::UnknownCommand(_) => BootstrapState::SecureChannelEstablished,
            BootstrapError::ClientStatus(_) => BootstrapState::KeySent,
            BootstrapError::OpenKey(_) |
            BootstrapError::Register(_) |
            BootstrapError::Acknowledge(_) => BootstrapState::SymKeyAwaited,
        }
    }
}

/// Error that can happen on the client side of a circuit.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Secured transport can't be established.
    #[error("Secure handshake error: {}", _0)]
    Handshake(HandshakeError),
    /// Record can't be sent.
    #[error("Send record error: {}", _0)]
    Send(EncodeError),
    /// Record can't be read.
    #[error("Read record error: {}", _0)]
    Read(DecodeError),
    /// Relay closed the connection.
    #[error("Connection closed by the relay")]
    Closed,
    /// Relay answered with a record that doesn't match the request.
    #[error("Unexpected record of {} bytes", len)]
    UnexpectedRecord {
        /// Length of the record.
        len: usize,
    },
    /// Relay answered with failure status.
    #[error("Relay rejected the request")]
    Rejected,
    /// Relay presented a different public key.
    #[error("Relay presented an unexpected public key")]
    UnexpectedKey,
    /// Hop key can't be sealed.
    #[error("Seal key error: {}", _0)]
    Seal(SealKeyError),
    /// Onion layer can't be added or removed.
    #[error("Onion layer error: {}", _0)]
    Layer(LayerError),
    /// Packet can't be serialized.
    #[error("Serialize error: {:?}", _0)]
    Serialize(GenError),
    /// Relay frame can't be parsed.
    #[error("Relay frame error: {}", _0)]
    Frame(FrameError),
    /// Relay frame is for another circuit or goes the wrong way.
    #[error("Unexpected relay frame for circuit {}", circuit_id)]
    UnexpectedFrame {
        /// Circuit id of the frame.
        circuit_id: CircuitId,
    },
    /// Relay cell can't be parsed.
    #[error("Malformed relay cell")]
    MalformedCell,
    /// Relay cell doesn't fit the current exchange.
    #[error("Unexpected relay cell")]
    UnexpectedCell,
    /// The final hop failed to extend the circuit.
    #[error("Circuit extension rejected")]
    ExtendRejected,
    /// Circuit already has the maximum number of hops.
    #[error("Circuit can't have more than {} hops", MAX_CIRCUIT_HOPS)]
    TooManyHops,
}

/// Error that can happen while a final hop extends its circuit.
#[derive(Debug, Error)]
pub enum ExtendError {
    /// Next relay can't be reached.
    #[error("Connect to the next relay error: {:?}", _0)]
    Connect(IoError),
    /// Extension didn't finish in time.
    #[error("Extension timed out")]
    Timeout,
    /// Bootstrap with the next relay failed.
    #[error("Bootstrap with the next relay error: {}", _0)]
    Client(ClientError),
    /// Established connection can't be turned into a transport session.
    #[error("Register transport error: {:?}", _0)]
    Register(IoError),
}

/// Error that can happen while routing one frame or one destination chunk.
///
/// Each variant affects one session at most; the forwarding loop decides
/// from the variant which session, if any, is closed.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Frame can't be parsed.
    #[error("Malformed frame from transport {}: {}", transport, error)]
    Frame {
        /// Transport the frame came from.
        transport: TransportId,
        /// Parsing error.
        error: FrameError,
    },
    /// No circuit with this id.
    #[error("No such circuit {}", _0)]
    NoSuchCircuit(CircuitId),
    /// Frame arrived on a transport that doesn't carry this circuit in its direction.
    #[error("Frame for circuit {} arrived from transport {}", circuit_id, transport)]
    WrongTransport {
        /// Circuit id of the frame.
        circuit_id: CircuitId,
        /// Transport the frame came from.
        transport: TransportId,
    },
    /// Onion layer can't be removed or added.
    #[error("Onion layer error on circuit {}: {}", circuit_id, error)]
    Layer {
        /// Circuit of the frame.
        circuit_id: CircuitId,
        /// Layer error.
        error: LayerError,
    },
    /// Relay cell can't be parsed.
    #[error("Malformed relay cell on circuit {}", _0)]
    MalformedCell(CircuitId),
    /// Relay cell makes no sense at this hop.
    #[error("Unexpected relay cell on circuit {}", _0)]
    UnexpectedCell(CircuitId),
    /// Circuit is being extended and can't forward yet.
    #[error("Circuit {} is being extended", _0)]
    Extending(CircuitId),
    /// Frame would exceed the maximum relay frame size.
    #[error("Frame for circuit {} is too big: {} bytes", circuit_id, len)]
    TooBig {
        /// Circuit of the frame.
        circuit_id: CircuitId,
        /// Payload size.
        len: usize,
    },
    /// Packet can't be serialized.
    #[error("Serialize error: {:?}", _0)]
    Serialize(GenError),
    /// Destination can't be connected.
    #[error("Connect destination of circuit {} error: {:?}", circuit_id, error)]
    Connect {
        /// Circuit to connect the destination for.
        circuit_id: CircuitId,
        /// Socket error.
        error: IoError,
    },
    /// Too much data is waiting for a destination that is still connecting.
    #[error("Destination of circuit {} is still connecting, {} cells are queued already", circuit_id, queued)]
    Backlog {
        /// Circuit waiting for its destination.
        circuit_id: CircuitId,
        /// Number of queued data cells.
        queued: usize,
    },
    /// No transport with this id.
    #[error("No such transport {}", _0)]
    NoSuchTransport(TransportId),
    /// Record can't be written to a transport.
    #[error("Send to transport {} error: {}", transport, error)]
    SendTransport {
        /// Transport written to.
        transport: TransportId,
        /// Write error.
        error: SendRecordError,
    },
    /// No destination with this id.
    #[error("No such destination {}", _0)]
    NoSuchDestination(DestinationId),
    /// Data can't be written to a destination.
    #[error("Write to destination {} error: {:?}", destination, error)]
    WriteDestination {
        /// Destination written to.
        destination: DestinationId,
        /// Socket error.
        error: IoError,
    },
}

/// Error that stops a running relay.
#[derive(Debug, Error)]
pub enum RunError {
    /// Listening socket failed.
    #[error("Accept connection error: {:?}", _0)]
    Accept(IoError),
    /// Forwarding loop task panicked or was aborted.
    #[error("Forwarding loop error: {}", _0)]
    Forwarding(JoinError),
}
