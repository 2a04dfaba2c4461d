/*! Codec to deal with [`ClientHandshake`] and [`ServerHandshake`] in terms of tokio-io
*/

use std::io::{Error, ErrorKind};
use std::marker::PhantomData;

use porc_binary_io::*;
use crate::relay::handshake::packet::*;

use bytes::{Buf, BytesMut};
use nom::{Err, Offset};
use tokio_util::codec::{Decoder, Encoder};

/// Buffer size enough for any handshake packet.
const MAX_HANDSHAKE_SIZE: usize = CLIENT_HANDSHAKE_SIZE;

/// Implements tokio-io's Decoder and Encoder for one handshake packet type.
pub struct HandshakeCodec<P> {
    packet: PhantomData<P>,
}

/// Codec used by the relay to read the client's half of the handshake.
pub type ClientHandshakeCodec = HandshakeCodec<ClientHandshake>;

/// Codec used by the client to read the relay's half of the handshake.
pub type ServerHandshakeCodec = HandshakeCodec<ServerHandshake>;

impl<P> HandshakeCodec<P> {
    /// Make object
    pub fn new() -> Self {
        HandshakeCodec { packet: PhantomData }
    }
}

impl<P> Default for HandshakeCodec<P> {
    fn default() -> Self {
        HandshakeCodec::new()
    }
}

impl<P: FromBytes> Decoder for HandshakeCodec<P> {
    type Item = P;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (consumed, handshake) = match P::from_bytes(buf) {
            Err(Err::Incomplete(_)) => {
                return Ok(None)
            },
            Err(e) => {
                return Err(Error::new(ErrorKind::InvalidData, format!("Handshake deserialize error: {:?}", e.map(|e| e.code))))
            },
            Ok((i, handshake)) => {
                (buf.offset(i), handshake)
            }
        };
        buf.advance(consumed);
        Ok(Some(handshake))
    }
}

impl<P: ToBytes> Encoder<P> for HandshakeCodec<P> {
    type Error = Error;

    fn encode(&mut self, handshake: P, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut handshake_buf = [0; MAX_HANDSHAKE_SIZE];
        handshake.to_bytes((&mut handshake_buf, 0))
            .map(|(handshake_buf, handshake_size)|
                buf.extend_from_slice(&handshake_buf[..handshake_size])
            )
            .map_err(|e|
                Error::new(ErrorKind::Other, format!("Handshake serialize error: {:?}", e))
            )
    }
}
