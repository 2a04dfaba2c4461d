/*! Handshake that turns a raw TCP connection into a secured transport.

```text
client                                         relay
  |  ClientHandshake { pk, nonce, E(session pk, nonce) }  |
  | ----------------------------------------------------> |
  |       ServerHandshake { nonce, E(session pk, nonce) } |
  | <---------------------------------------------------- |
  |          records encrypted with session keys          |
```

Both payloads are encrypted with the precomputed key of the client's
long-term SK and the relay's long-term PK, so only the holder of the relay's
SK can answer.

*/

pub mod packet;
pub mod codec;

pub use self::packet::*;
pub use self::codec::*;

use crypto_box::{SalsaBox, aead::{Aead, AeadCore}};
use porc_binary_io::*;
use porc_crypto::*;
use crate::relay::errors::HandshakeError;
use crate::relay::secure;

use futures::{StreamExt, SinkExt};
use tokio_util::codec::Framed;
use tokio::net::TcpStream;

fn seal_payload(common_key: &SalsaBox, session: &secure::Session) -> Result<(Nonce, Vec<u8>), HandshakeError> {
    let payload = HandshakePayload { session_pk: session.pk().clone(), session_nonce: *session.nonce() };

    let mut serialized_payload = [0; PAYLOAD_SIZE];
    let (serialized_payload, _) = payload.to_bytes((&mut serialized_payload, 0))
        .map_err(|e| HandshakeError::SerializePayload(format!("{:?}", e)))?;

    let nonce = SalsaBox::generate_nonce(&mut rand::thread_rng());
    let encrypted_payload = common_key.encrypt(&nonce, &serialized_payload[..])
        .map_err(|_| HandshakeError::EncryptPayload)?;
    Ok((nonce.into(), encrypted_payload))
}

fn open_payload(common_key: &SalsaBox, nonce: &Nonce, payload: &[u8]) -> Result<HandshakePayload, HandshakeError> {
    let payload_bytes = common_key.decrypt(nonce.into(), payload)
        .map_err(|_| HandshakeError::DecryptPayload)?;
    let (_, payload) = HandshakePayload::from_bytes(&payload_bytes)
        .map_err(|_| HandshakeError::DeserializePayload)?;
    Ok(payload)
}

/// Create a handshake from client to relay
pub fn create_client_handshake(client_pk: &PublicKey,
                               client_sk: &SecretKey,
                               server_pk: &PublicKey)
    -> Result<(secure::Session, SalsaBox, ClientHandshake), HandshakeError> {
    let session = secure::Session::random();
    let common_key = SalsaBox::new(server_pk, client_sk);
    let (nonce, payload) = seal_payload(&common_key, &session)?;

    let handshake = ClientHandshake {
        pk: client_pk.clone(),
        nonce,
        payload,
    };
    Ok((session, common_key, handshake))
}

/// Handle received client handshake on the relay side.
/// Return secure::Channel, Client PK, server handshake
pub fn handle_client_handshake(server_sk: &SecretKey,
                               client_handshake: &ClientHandshake)
    -> Result<(secure::Channel, PublicKey, ServerHandshake), HandshakeError> {
    let common_key = SalsaBox::new(&client_handshake.pk, server_sk);
    let payload = open_payload(&common_key, &client_handshake.nonce, &client_handshake.payload)?;

    let session = secure::Session::random();
    let (nonce, payload_out) = seal_payload(&common_key, &session)?;

    let server_handshake = ServerHandshake {
        nonce,
        payload: payload_out,
    };
    let channel = secure::Channel::new(&session, &payload.session_pk, &payload.session_nonce);
    Ok((channel, client_handshake.pk.clone(), server_handshake))
}

/// Handle received server handshake on the client side.
pub fn handle_server_handshake(common_key: &SalsaBox,
                               client_session: &secure::Session,
                               server_handshake: &ServerHandshake)
    -> Result<secure::Channel, HandshakeError> {
    let payload = open_payload(common_key, &server_handshake.nonce, &server_handshake.payload)?;
    Ok(secure::Channel::new(client_session, &payload.session_pk, &payload.session_nonce))
}

/// Sends handshake to the relay, receives handshake from the relay
/// and processes it
pub async fn make_client_handshake(
    socket: TcpStream,
    client_pk: &PublicKey,
    client_sk: &SecretKey,
    server_pk: &PublicKey
) -> Result<(TcpStream, secure::Channel), HandshakeError> {
    let (session, common_key, handshake) =
        create_client_handshake(client_pk, client_sk, server_pk)?;

    let mut client = Framed::new(socket, ClientHandshakeCodec::new());
    client.send(handshake).await
        .map_err(HandshakeError::Send)?;

    let socket = client.into_inner();
    let server = Framed::new(socket, ServerHandshakeCodec::new());
    let (handshake, server_socket) = server.into_future().await;
    let handshake = match handshake {
        None => return Err(HandshakeError::Closed),
        Some(Err(e)) => return Err(HandshakeError::Read(e)),
        Some(Ok(handshake)) => handshake,
    };

    handle_server_handshake(&common_key, &session, &handshake)
        .map(|chan| (server_socket.into_inner(), chan))
}

/// Receives handshake from the client, processes it and
/// sends handshake to the client
pub async fn make_server_handshake(
    socket: TcpStream,
    server_sk: &SecretKey
) -> Result<(TcpStream, secure::Channel, PublicKey), HandshakeError> {
    let client = Framed::new(socket, ClientHandshakeCodec::new());

    let (handshake, client) = client.into_future().await;
    let handshake = match handshake {
        None => return Err(HandshakeError::Closed),
        Some(Err(e)) => return Err(HandshakeError::Read(e)),
        Some(Ok(handshake)) => handshake,
    };

    let (channel, client_pk, server_handshake) =
        handle_client_handshake(server_sk, &handshake)?;

    let socket = client.into_inner();
    let mut server = Framed::new(socket, ServerHandshakeCodec::new());
    server.send(server_handshake).await
        .map_err(HandshakeError::Send)?;

    let socket = server.into_inner();
    Ok((socket, channel, client_pk))
}
