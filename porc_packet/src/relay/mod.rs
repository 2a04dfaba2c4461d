/*! Relay frames carried over the secured transport after bootstrap.
*/

mod circuit_id;

pub use self::circuit_id::CircuitId;

use porc_binary_io::*;

use nom::branch::alt;
use nom::bytes::complete::{tag, take};
use nom::combinator::{map, success, value, verify};
use nom::number::complete::be_u16;
use thiserror::Error;

/// Maximum size of a decrypted record on the secured transport.
pub const MAX_RECORD_SIZE: usize = 2032;

/// Size of the [`RelayFrame`] header: length, direction and circuit id.
pub const RELAY_FRAME_HEADER_SIZE: usize = 7;

/// Maximum size of a [`RelayFrame`] payload so the frame fits one record.
pub const MAX_RELAY_FRAME_PAYLOAD_SIZE: usize = MAX_RECORD_SIZE - RELAY_FRAME_HEADER_SIZE;

/// Byte of [`Direction::Downstream`].
pub const DIRECTION_DOWNSTREAM: u8 = 0x01;
/// Byte of [`Direction::Upstream`].
pub const DIRECTION_UPSTREAM: u8 = 0x02;

/// Direction a [`RelayFrame`] travels along its circuit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// From the origin toward the destination. Each hop removes a layer.
    Downstream,
    /// From the destination back to the origin. Each hop adds a layer.
    Upstream,
}

impl Direction {
    /// Wire representation of the direction.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::Downstream => DIRECTION_DOWNSTREAM,
            Direction::Upstream => DIRECTION_UPSTREAM,
        }
    }
}

impl FromBytes for Direction {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            value(Direction::Downstream, tag(&[DIRECTION_DOWNSTREAM][..])),
            value(Direction::Upstream, tag(&[DIRECTION_UPSTREAM][..])),
        ))(input)
    }
}

/** Frame routed hop by hop along a circuit.

`circuit_id` is the id the receiving side knows the circuit by, so every hop
rewrites it before passing the frame on.

Serialized form:

Length     | Content
---------- | ------
`2`        | Length of the whole frame in BigEndian
`1`        | Direction (`0x01` downstream, `0x02` upstream)
`4`        | Circuit id in BigEndian
variable   | Onion payload (max 2025)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayFrame {
    /// Direction of the frame.
    pub direction: Direction,
    /// Id of the circuit on the receiving side.
    pub circuit_id: CircuitId,
    /// Layered payload.
    pub payload: Vec<u8>,
}

/// Error that can happen when parsing a [`RelayFrame`] from a record.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FrameError {
    /// Header can't be parsed or has invalid values.
    #[error("Malformed relay frame of {len} bytes")]
    Malformed {
        /// Length of the record.
        len: usize,
    },
    /// Length field doesn't match the size of the record.
    #[error("Relay frame length {declared} doesn't match record length {actual}")]
    LengthMismatch {
        /// Value of the length field.
        declared: usize,
        /// Size of the record.
        actual: usize,
    },
}

impl RelayFrame {
    /// Parse a frame occupying exactly one record.
    pub fn parse(record: &[u8]) -> Result<RelayFrame, FrameError> {
        match RelayFrame::from_bytes(record) {
            Ok((rest, frame)) if rest.is_empty() => Ok(frame),
            Ok((_, frame)) => Err(FrameError::LengthMismatch {
                declared: RELAY_FRAME_HEADER_SIZE + frame.payload.len(),
                actual: record.len(),
            }),
            Err(_) => match be_u16::<_, nom::error::Error<&[u8]>>(record) {
                Ok((_, declared)) if declared as usize != record.len() => Err(FrameError::LengthMismatch {
                    declared: declared as usize,
                    actual: record.len(),
                }),
                _ => Err(FrameError::Malformed { len: record.len() }),
            },
        }
    }
}

impl FromBytes for RelayFrame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, length) = be_u16(input)?;
        let (input, length) = verify(success(length as usize), |len| {
            *len >= RELAY_FRAME_HEADER_SIZE && *len <= MAX_RECORD_SIZE
        })(input)?;
        let (input, direction) = Direction::from_bytes(input)?;
        let (input, circuit_id) = CircuitId::from_bytes(input)?;
        let (input, payload) = map(take(length - RELAY_FRAME_HEADER_SIZE), <[u8]>::to_vec)(input)?;
        Ok((input, RelayFrame { direction, circuit_id, payload }))
    }
}

impl ToBytes for RelayFrame {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.payload.len() > MAX_RELAY_FRAME_PAYLOAD_SIZE, |buf| gen_error(buf, 0)) >>
            gen_be_u16!((RELAY_FRAME_HEADER_SIZE + self.payload.len()) as u16) >>
            gen_be_u8!(self.direction.as_byte()) >>
            gen_be_u32!(self.circuit_id.get()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

/** Records are encrypted and sent in this form.

Serialized form:

Length     | Content
---------- | ------
`2`        | Length of encrypted payload in BigEndian
variable   | Encrypted payload (max 2048)

*/
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EncryptedPacket {
    /// Encrypted payload
    pub payload: Vec<u8>,
}

/// A serialized EncryptedPacket should be not longer than 2050 bytes
pub const MAX_ENC_PACKET_SIZE: usize = 2050;

/// A serialized EncryptedPacket payload should be not longer than 2048 bytes
pub const MAX_ENC_PACKET_PAYLOAD_SIZE: usize = 2048;

impl FromBytes for EncryptedPacket {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, length) = nom::number::streaming::be_u16(input)?;
        let (input, _) = verify(success(length), |len| {
            *len > 0 && *len as usize <= MAX_ENC_PACKET_PAYLOAD_SIZE
        })(input)?;
        let (input, payload) = nom::bytes::streaming::take(length)(input)?;
        Ok((
            input,
            EncryptedPacket {
                payload: payload.to_vec(),
            },
        ))
    }
}

impl ToBytes for EncryptedPacket {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.payload.len() > MAX_ENC_PACKET_PAYLOAD_SIZE, |buf| gen_error(buf, 0)) >>
            gen_be_u16!(self.payload.len() as u16) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}
