/*! Codec for records on the secured transport.

A record is any plaintext of at most [`MAX_RECORD_SIZE`] bytes. On the wire it
travels as an [`EncryptedPacket`] encrypted with the session [`Channel`].
*/

use std::io::Error as IoError;

use porc_binary_io::*;
use porc_packet::relay::*;
use crate::relay::secure::Channel;

use bytes::{Buf, BytesMut};
use nom::{Err, Offset};
use nom::error::ErrorKind;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Error that can happen when decoding a record from bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Error indicates that received encrypted packet can't be parsed.
    #[error("Deserialize EncryptedPacket error: {:?}, buffer length: {}", error, len)]
    DeserializeEncrypted {
        /// Parsing error.
        error: ErrorKind,
        /// Length of the buffered data.
        len: usize,
    },
    /// Error indicates that received encrypted packet can't be decrypted.
    #[error("Decrypt EncryptedPacket error")]
    Decrypt,
    /// General IO error.
    #[error("IO error: {:?}", _0)]
    Io(IoError),
}

/// Error that can happen when encoding a record to bytes.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Record doesn't fit into one encrypted packet.
    #[error("Record should not be longer than {} bytes: {} bytes", MAX_RECORD_SIZE, len)]
    TooBigRecord {
        /// Length of the record.
        len: usize,
    },
    /// Record can't be encrypted.
    #[error("Encrypt record error")]
    Encrypt,
    /// Error indicates that a packet is invalid and can't be serialized.
    #[error("Serialize packet error: {:?}", error)]
    Serialize {
        /// Serialization error.
        error: GenError,
    },
    /// General IO error.
    #[error("IO error: {:?}", _0)]
    Io(IoError),
}

impl EncodeError {
    pub(crate) fn serialize(error: GenError) -> EncodeError {
        EncodeError::Serialize { error }
    }
}

impl From<IoError> for DecodeError {
    fn from(error: IoError) -> DecodeError {
        DecodeError::Io(error)
    }
}

impl From<IoError> for EncodeError {
    fn from(error: IoError) -> EncodeError {
        EncodeError::Io(error)
    }
}

/// Serialize a packet into a record.
pub fn to_record<P: ToBytes>(packet: &P) -> Result<Vec<u8>, EncodeError> {
    let mut buf = [0; MAX_RECORD_SIZE];
    let (_, size) = packet.to_bytes((&mut buf, 0))
        .map_err(EncodeError::serialize)?;
    Ok(buf[..size].to_vec())
}

/// Struct to use for {de-,}serializing records on the secured transport.
///
/// Clones share the session key, so the read half and the write half of a
/// connection may own a clone each.
#[derive(Clone)]
pub struct Codec {
    channel: Channel,
}

impl Codec {
    /// Make object
    pub fn new(channel: Channel) -> Codec {
        Codec { channel }
    }
}

impl Decoder for Codec {
    type Item = Vec<u8>;
    type Error = DecodeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // deserialize EncryptedPacket
        let (consumed, encrypted_packet) = match EncryptedPacket::from_bytes(buf) {
            Err(Err::Incomplete(_)) => {
                return Ok(None)
            },
            Err(Err::Error(error)) | Err(Err::Failure(error)) => {
                return Err(DecodeError::DeserializeEncrypted { error: error.code, len: buf.len() })
            },
            Ok((i, encrypted_packet)) => {
                (buf.offset(i), encrypted_packet)
            }
        };

        // decrypt payload
        let record = self.channel.decrypt(&encrypted_packet.payload)
            .map_err(|_| DecodeError::Decrypt)?;

        buf.advance(consumed);
        Ok(Some(record))
    }
}

impl Encoder<Vec<u8>> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, record: Vec<u8>, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(EncodeError::TooBigRecord { len: record.len() })
        }

        let payload = self.channel.encrypt(&record)
            .map_err(|_| EncodeError::Encrypt)?;
        let encrypted_packet = EncryptedPacket { payload };

        let mut packet_buf = [0; MAX_ENC_PACKET_SIZE];
        encrypted_packet.to_bytes((&mut packet_buf, 0))
            .map(|(packet_buf, size)|
                buf.extend_from_slice(&packet_buf[..size])
            )
            .map_err(EncodeError::serialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::relay::secure::*;

    fn create_codecs_pair() -> (Codec, Codec) {
        let alice_session = Session::random();
        let bob_session = Session::random();

        let alice_channel = Channel::new(&alice_session, bob_session.pk(), bob_session.nonce());
        let bob_channel = Channel::new(&bob_session, alice_session.pk(), alice_session.nonce());

        (Codec::new(alice_channel), Codec::new(bob_channel))
    }

    #[test]
    fn encode_decode() {
        let (mut alice_codec, mut bob_codec) = create_codecs_pair();
        let mut buf = BytesMut::new();

        let records = vec![
            vec![1],
            vec![42; 100],
            vec![7; MAX_RECORD_SIZE],
        ];
        for record in records {
            alice_codec.encode(record.clone(), &mut buf).expect("should encode");
            let res = bob_codec.decode(&mut buf).unwrap().expect("should decode");
            assert_eq!(record, res);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn decode_pipelined_records() {
        let (mut alice_codec, mut bob_codec) = create_codecs_pair();
        let mut buf = BytesMut::new();

        alice_codec.encode(vec![1, 2, 3], &mut buf).unwrap();
        alice_codec.encode(vec![4, 5], &mut buf).unwrap();

        assert_eq!(bob_codec.decode(&mut buf).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(bob_codec.decode(&mut buf).unwrap(), Some(vec![4, 5]));
        assert_eq!(bob_codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_incomplete() {
        let (mut alice_codec, mut bob_codec) = create_codecs_pair();
        let mut buf = BytesMut::new();
        alice_codec.encode(vec![1, 2, 3], &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(bob_codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(bob_codec.decode(&mut partial).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn decode_zero_length() {
        let (_alice_codec, mut bob_codec) = create_codecs_pair();
        let mut buf = BytesMut::from(&[0, 0][..]);
        assert!(matches!(bob_codec.decode(&mut buf), Err(DecodeError::DeserializeEncrypted { .. })));
    }

    #[test]
    fn decode_wrong_key() {
        let (mut alice_codec, _bob_codec) = create_codecs_pair();
        let (_, mut mallory_codec) = create_codecs_pair();
        let mut buf = BytesMut::new();
        alice_codec.encode(vec![1, 2, 3], &mut buf).unwrap();
        assert!(matches!(mallory_codec.decode(&mut buf), Err(DecodeError::Decrypt)));
    }

    #[test]
    fn encode_too_big_record() {
        let (mut alice_codec, _bob_codec) = create_codecs_pair();
        let mut buf = BytesMut::new();
        let res = alice_codec.encode(vec![0; MAX_RECORD_SIZE + 1], &mut buf);
        assert!(matches!(res, Err(EncodeError::TooBigRecord { len }) if len == MAX_RECORD_SIZE + 1));
        assert!(buf.is_empty());
    }

    #[test]
    fn to_record_relay_frame() {
        let frame = RelayFrame {
            direction: Direction::Upstream,
            circuit_id: CircuitId::new(3).unwrap(),
            payload: vec![9; 4],
        };
        let record = to_record(&frame).unwrap();
        assert_eq!(record, vec![0, 11, 2, 0, 0, 0, 3, 9, 9, 9, 9]);
    }
}
