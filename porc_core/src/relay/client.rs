/*! Client side of the bootstrap handshake and of circuits.

A client connects to the entry relay, bootstraps one hop and then grows the
circuit by asking the current last hop to extend it:

```text
client -> R1            bootstrap hop 1 directly
client => R1 -> R2      Extend cell, R1 bootstraps hop 2 on behalf of the client
client => R1 => R2 -> R3
```

Downstream payloads are wrapped with the entry hop's layer outermost; upstream
payloads are unwrapped starting with the entry hop's layer.
*/

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use porc_binary_io::*;
use porc_crypto::*;
use porc_packet::bootstrap::*;
use porc_packet::cell::*;
use porc_packet::relay::*;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::relay::codec::{to_record, Codec};
use crate::relay::errors::{ClientError, HandshakeError};
use crate::relay::handshake::make_client_handshake;

/// Secured connection driven record by record.
pub type SecureStream = Framed<TcpStream, Codec>;

/// Run the secured transport handshake over an established connection.
pub async fn secure_connect(
    stream: TcpStream,
    client_pk: &PublicKey,
    client_sk: &SecretKey,
    relay_pk: &PublicKey,
) -> Result<SecureStream, ClientError> {
    let (stream, channel) = make_client_handshake(stream, client_pk, client_sk, relay_pk).await
        .map_err(ClientError::Handshake)?;
    Ok(Framed::new(stream, Codec::new(channel)))
}

/// Connect to a relay and establish the secured transport.
pub async fn connect_relay(
    addr: SocketAddr,
    relay_pk: &PublicKey,
    client_pk: &PublicKey,
    client_sk: &SecretKey,
) -> Result<SecureStream, ClientError> {
    let stream = TcpStream::connect(addr).await
        .map_err(|e| ClientError::Handshake(HandshakeError::Connect(e)))?;
    secure_connect(stream, client_pk, client_sk, relay_pk).await
}

async fn send_packet<P: ToBytes>(stream: &mut SecureStream, packet: &P) -> Result<(), ClientError> {
    let record = to_record(packet).map_err(ClientError::Send)?;
    stream.send(record).await.map_err(ClientError::Send)
}

async fn read_record(stream: &mut SecureStream) -> Result<Vec<u8>, ClientError> {
    match stream.next().await {
        None => Err(ClientError::Closed),
        Some(Err(e)) => Err(ClientError::Read(e)),
        Some(Ok(record)) => Ok(record),
    }
}

async fn read_packet<P: FromBytes>(stream: &mut SecureStream, size: usize) -> Result<P, ClientError> {
    let record = read_record(stream).await?;
    let len = record.len();
    if len != size {
        return Err(ClientError::UnexpectedRecord { len })
    }
    P::from_bytes(&record)
        .map(|(_, packet)| packet)
        .map_err(|_| ClientError::UnexpectedRecord { len })
}

/// Ask the relay for its public key. `predecessor` is set when a relay
/// extends a circuit it carries under that id.
pub async fn request_public_key(stream: &mut SecureStream, predecessor: Option<CircuitId>) -> Result<PublicKey, ClientError> {
    send_packet(stream, &PubKeyRequest { predecessor }).await?;
    let response: PubKeyResponse = read_packet(stream, PUB_KEY_RESPONSE_SIZE).await?;
    if response.status != Status::Success {
        return Err(ClientError::Rejected)
    }
    Ok(response.pk)
}

/// Hand a sealed hop key to the relay and receive the id of the new circuit.
pub async fn send_sealed_key(stream: &mut SecureStream, sealed_key: SealedKey) -> Result<CircuitId, ClientError> {
    send_packet(stream, &SymKeyResponse { status: Status::Success, sealed_key }).await?;
    let response: BootstrapResponse = read_packet(stream, BOOTSTRAP_RESPONSE_SIZE).await?;
    Ok(response.circuit_id)
}

/// Bootstrap one hop: verify the relay's key, seal a fresh hop key to it and
/// get the circuit id back.
pub async fn create_hop(
    stream: &mut SecureStream,
    predecessor: Option<CircuitId>,
    relay_pk: &PublicKey,
) -> Result<(CircuitId, LayerKey), ClientError> {
    let pk = request_public_key(stream, predecessor).await?;
    if pk != *relay_pk {
        return Err(ClientError::UnexpectedKey)
    }
    let key = LayerKey::generate();
    let sealed_key = seal_key(&pk, &key).map_err(ClientError::Seal)?;
    let circuit_id = send_sealed_key(stream, sealed_key).await?;
    Ok((circuit_id, key))
}

/// Send one relay frame as one record.
pub async fn send_frame(stream: &mut SecureStream, frame: &RelayFrame) -> Result<(), ClientError> {
    send_packet(stream, frame).await
}

/// Read one relay frame.
pub async fn read_frame(stream: &mut SecureStream) -> Result<RelayFrame, ClientError> {
    let record = read_record(stream).await?;
    RelayFrame::parse(&record).map_err(ClientError::Frame)
}

/// Wrap a payload for the hops with `keys`, entry hop first.
pub fn wrap_layers(keys: &[LayerKey], payload: &[u8]) -> Result<Vec<u8>, LayerError> {
    keys.iter().rev().try_fold(payload.to_vec(), |payload, key| key.add_layer(&payload))
}

/// Unwrap a payload that passed the hops with `keys`, entry hop first.
pub fn unwrap_layers(keys: &[LayerKey], payload: &[u8]) -> Result<Vec<u8>, LayerError> {
    keys.iter().try_fold(payload.to_vec(), |payload, key| key.remove_layer(&payload))
}

/// Circuit built by a client through one or more relays.
pub struct OnionCircuit {
    stream: SecureStream,
    circuit_id: CircuitId,
    keys: Vec<LayerKey>,
}

impl OnionCircuit {
    /// Connect to the entry relay and bootstrap the first hop.
    pub async fn connect(
        addr: SocketAddr,
        relay_pk: &PublicKey,
        client_pk: &PublicKey,
        client_sk: &SecretKey,
    ) -> Result<OnionCircuit, ClientError> {
        let mut stream = connect_relay(addr, relay_pk, client_pk, client_sk).await?;
        let (circuit_id, key) = create_hop(&mut stream, None, relay_pk).await?;
        Ok(OnionCircuit { stream, circuit_id, keys: vec![key] })
    }

    /// Id the entry relay assigned to the circuit.
    pub fn circuit_id(&self) -> CircuitId {
        self.circuit_id
    }

    /// Number of hops.
    pub fn hops(&self) -> usize {
        self.keys.len()
    }

    /// Append a relay to the end of the circuit.
    pub async fn extend(&mut self, addr: SocketAddr, relay_pk: PublicKey) -> Result<(), ClientError> {
        if self.keys.len() >= MAX_CIRCUIT_HOPS {
            return Err(ClientError::TooManyHops)
        }

        let key = LayerKey::generate();
        let sealed_key = seal_key(&relay_pk, &key).map_err(ClientError::Seal)?;
        self.send_cell(&RelayCell::Extend(ExtendCell { addr, relay_pk, sealed_key })).await?;

        match self.recv_cell().await? {
            RelayCell::Extended(ExtendedCell { status: Status::Success }) => {
                self.keys.push(key);
                Ok(())
            },
            RelayCell::Extended(ExtendedCell { status: Status::Failure }) => Err(ClientError::ExtendRejected),
            _ => Err(ClientError::UnexpectedCell),
        }
    }

    /// Send a cell to the last hop.
    pub async fn send_cell(&mut self, cell: &RelayCell) -> Result<(), ClientError> {
        let cell = cell.to_vec().map_err(ClientError::Serialize)?;
        let payload = wrap_layers(&self.keys, &cell).map_err(ClientError::Layer)?;
        let frame = RelayFrame {
            direction: Direction::Downstream,
            circuit_id: self.circuit_id,
            payload,
        };
        send_frame(&mut self.stream, &frame).await
    }

    /// Receive the next cell sent back by the last hop.
    pub async fn recv_cell(&mut self) -> Result<RelayCell, ClientError> {
        let frame = read_frame(&mut self.stream).await?;
        if frame.direction != Direction::Upstream || frame.circuit_id != self.circuit_id {
            return Err(ClientError::UnexpectedFrame { circuit_id: frame.circuit_id })
        }
        let cell = unwrap_layers(&self.keys, &frame.payload).map_err(ClientError::Layer)?;
        RelayCell::from_bytes(&cell)
            .map(|(_, cell)| cell)
            .map_err(|_| ClientError::MalformedCell)
    }

    /// Send data to the destination behind the last hop.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.send_cell(&RelayCell::Data(DataCell { data: data.to_vec() })).await
    }

    /// Receive the next chunk of data from the destination.
    pub async fn recv_data(&mut self) -> Result<Vec<u8>, ClientError> {
        match self.recv_cell().await? {
            RelayCell::Data(DataCell { data }) => Ok(data),
            _ => Err(ClientError::UnexpectedCell),
        }
    }

    /// Close the circuit by closing the connection to the entry relay.
    pub fn into_stream(self) -> SecureStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_layers() {
        let keys = vec![LayerKey::generate(), LayerKey::generate(), LayerKey::generate()];
        let wrapped = wrap_layers(&keys, b"payload").unwrap();
        assert_eq!(wrapped.len(), 7 + 3 * LAYER_OVERHEAD);
        assert_eq!(unwrap_layers(&keys, &wrapped).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn entry_hop_layer_is_outermost() {
        let keys = vec![LayerKey::generate(), LayerKey::generate()];
        let wrapped = wrap_layers(&keys, b"payload").unwrap();

        // the entry hop peels its layer first
        let inner = keys[0].remove_layer(&wrapped).unwrap();
        assert_eq!(keys[1].remove_layer(&inner).unwrap(), b"payload".to_vec());
        assert!(keys[1].remove_layer(&wrapped).is_err());
    }

    #[test]
    fn upstream_layers_unwrap_in_path_order() {
        let keys = vec![LayerKey::generate(), LayerKey::generate()];
        // last hop adds its layer first, entry hop adds the outermost one
        let from_last = keys[1].add_layer(b"reply").unwrap();
        let from_entry = keys[0].add_layer(&from_last).unwrap();
        assert_eq!(unwrap_layers(&keys, &from_entry).unwrap(), b"reply".to_vec());
    }

    #[test]
    fn unwrap_with_wrong_keys() {
        let keys = vec![LayerKey::generate()];
        let wrapped = wrap_layers(&keys, b"payload").unwrap();
        assert_eq!(unwrap_layers(&[LayerKey::generate()], &wrapped), Err(LayerError::Decrypt));
    }

    #[test]
    fn no_layers() {
        assert_eq!(wrap_layers(&[], b"plain").unwrap(), b"plain".to_vec());
        assert_eq!(unwrap_layers(&[], b"plain").unwrap(), b"plain".to_vec());
    }
}
