/*! Packets of the secured transport handshake.

The client proves knowledge of the relay's long-term public key by encrypting
its session key material to it; the relay answers with its own session key
material encrypted under the same precomputed key.

*/

use porc_binary_io::*;
use porc_crypto::*;
use nom::bytes::streaming::take;

/** The request of the client to open a secured transport.

Serialized form:

Length  | Contents
------- | --------
`32`    | Long-term PK of the client
`24`    | Nonce of the encrypted payload
`72`    | Encrypted payload (plus MAC)

*/
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ClientHandshake {
    /// Client's Public Key
    pub pk: PublicKey,
    /// Nonce for the current encrypted payload
    pub nonce: Nonce,
    /// Encrypted [`HandshakePayload`]
    pub payload: Vec<u8>
}

/// A serialized client handshake must be equal to 32 (PK) + 24 (nonce)
/// \+ 72 (encrypted payload) bytes
pub const CLIENT_HANDSHAKE_SIZE: usize = 128;

impl FromBytes for ClientHandshake {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, pk) = PublicKey::from_bytes(input)?;
        let (input, nonce) = Nonce::from_bytes(input)?;
        let (input, payload) = take(ENC_PAYLOAD_SIZE)(input)?;
        Ok((input, ClientHandshake { pk, nonce, payload: payload.to_vec() }))
    }
}

impl ToBytes for ClientHandshake {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.payload.len() != ENC_PAYLOAD_SIZE, |buf| gen_error(buf, 0)) >>
            gen_slice!(self.pk.as_ref()) >>
            gen_slice!(self.nonce.as_ref()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

/** The response of the relay to a [`ClientHandshake`].

Serialized form:

Length  | Contents
------- | --------
`24`    | Nonce for the encrypted payload
`72`    | Encrypted payload (plus MAC)

*/
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ServerHandshake {
    /// Nonce of the encrypted payload
    pub nonce: Nonce,
    /// Encrypted [`HandshakePayload`]
    pub payload: Vec<u8>
}

/// A serialized server handshake must be equal to 24 (nonce)
/// \+ 72 (encrypted payload) bytes
pub const SERVER_HANDSHAKE_SIZE: usize = 96;

impl FromBytes for ServerHandshake {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, nonce) = Nonce::from_bytes(input)?;
        let (input, payload) = take(ENC_PAYLOAD_SIZE)(input)?;
        Ok((input, ServerHandshake { nonce, payload: payload.to_vec() }))
    }
}

impl ToBytes for ServerHandshake {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.payload.len() != ENC_PAYLOAD_SIZE, |buf| gen_error(buf, 0)) >>
            gen_slice!(self.nonce.as_ref()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

/** The payload of both handshake packets.

It's encrypted with the precomputed key of the client's long-term SK and the
relay's long-term PK.

Serialized and decrypted form:

Length  | Contents
------- | --------
`32`    | PublicKey for the current session
`24`    | Nonce of the current session

*/
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct HandshakePayload {
    /// Temporary Session PK
    pub session_pk: PublicKey,
    /// Temporary Session Nonce
    pub session_nonce: Nonce
}

/// A serialized payload must be equal to 32 (PK) + 24 (nonce) bytes
pub const PAYLOAD_SIZE: usize = 56;

/// A serialized encrypted payload must be equal to 32 (PK) + 24 (nonce) + 16 (MAC) bytes
pub const ENC_PAYLOAD_SIZE: usize = 72;

impl FromBytes for HandshakePayload {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, session_pk) = PublicKey::from_bytes(input)?;
        let (input, session_nonce) = Nonce::from_bytes(input)?;
        Ok((input, HandshakePayload { session_pk, session_nonce }))
    }
}

impl ToBytes for HandshakePayload {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.session_pk.as_ref()) >>
            gen_slice!(self.session_nonce.as_ref())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    encode_decode_test!(
        client_handshake_encode_decode,
        ClientHandshake {
            pk: SecretKey::generate(&mut thread_rng()).public_key(),
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE]
        }
    );

    encode_decode_test!(
        server_handshake_encode_decode,
        ServerHandshake {
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE]
        }
    );

    encode_decode_test!(
        handshake_payload_encode_decode,
        HandshakePayload {
            session_pk: SecretKey::generate(&mut thread_rng()).public_key(),
            session_nonce: [42; NONCEBYTES]
        }
    );

    #[test]
    fn client_handshake_size() {
        let handshake = ClientHandshake {
            pk: SecretKey::generate(&mut thread_rng()).public_key(),
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE]
        };
        let mut buf = [0; CLIENT_HANDSHAKE_SIZE];
        let (_, size) = handshake.to_bytes((&mut buf, 0)).unwrap();
        assert_eq!(size, CLIENT_HANDSHAKE_SIZE);
    }

    #[test]
    fn server_handshake_wrong_payload_size() {
        let handshake = ServerHandshake {
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE - 1]
        };
        let mut buf = [0; SERVER_HANDSHAKE_SIZE];
        assert!(handshake.to_bytes((&mut buf, 0)).is_err());
    }

    #[test]
    fn server_handshake_incomplete() {
        assert!(matches!(
            ServerHandshake::from_bytes(&[42; SERVER_HANDSHAKE_SIZE - 1]),
            Err(nom::Err::Incomplete(_))
        ));
    }
}
