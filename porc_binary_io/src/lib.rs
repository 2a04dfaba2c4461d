/*! Traits and helpers to serialize porc records into bytes and parse them back.

Parsing is done with [`nom`](https://docs.rs/nom) parsers, serialization with
[`cookie_factory`](https://docs.rs/cookie-factory) generators.
*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate cookie_factory;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use nom::IResult;
pub use cookie_factory::GenError;

use nom::bytes::streaming::take;
use nom::combinator::{map, map_opt};
use nom::error::{make_error, ErrorKind};
use nom::number::streaming::{be_u16, be_u8};

#[cfg(feature = "crypto")]
mod crypto;

#[cfg(feature = "crypto")]
pub use self::crypto::*;

/// Address family byte for IPv4 socket addresses.
pub const IPV4_FAMILY: u8 = 4;
/// Address family byte for IPv6 socket addresses.
pub const IPV6_FAMILY: u8 = 6;

/// The trait provides method to deserialize struct from raw bytes
pub trait FromBytes: Sized {
    /// Deserialize struct using `nom` from raw bytes
    fn from_bytes(i: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides method to serialize struct into raw bytes
pub trait ToBytes: Sized {
    /// Serialize struct into raw bytes using `cookie_factory`
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

/// Generator that always fails. Used to reject values that can't be encoded.
pub fn gen_error(_buf: (&mut [u8], usize), error: u32) -> Result<(&mut [u8], usize), GenError> {
    Err(GenError::CustomError(error))
}

/// Fail the serialization if the already written data exceeds `limit` bytes.
pub fn gen_len_limit(buf: (&mut [u8], usize), limit: usize) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::BufferTooBig(limit))
    }
}

impl<const N: usize> FromBytes for [u8; N] {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map_opt(take(N), |bytes: &[u8]| bytes.try_into().ok())(input)
    }
}

impl FromBytes for Ipv4Addr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; 4]>::from_bytes, Ipv4Addr::from)(input)
    }
}

impl FromBytes for Ipv6Addr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; 16]>::from_bytes, Ipv6Addr::from)(input)
    }
}

/** Socket address of a relay.

Serialized form:

Length      | Content
----------- | ------
`1`         | Address family (`4` or `6`)
`4` or `16` | IP address
`2`         | Port in BigEndian

*/
impl FromBytes for SocketAddr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, family) = be_u8(input)?;
        let (input, ip) = match family {
            IPV4_FAMILY => map(Ipv4Addr::from_bytes, IpAddr::V4)(input)?,
            IPV6_FAMILY => map(Ipv6Addr::from_bytes, IpAddr::V6)(input)?,
            _ => return Err(nom::Err::Error(make_error(input, ErrorKind::Switch))),
        };
        let (input, port) = be_u16(input)?;
        Ok((input, SocketAddr::new(ip, port)))
    }
}

impl ToBytes for SocketAddr {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self.ip() {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                do_gen!(buf,
                    gen_be_u8!(IPV4_FAMILY) >>
                    gen_slice!(&octets[..]) >>
                    gen_be_u16!(self.port())
                )
            },
            IpAddr::V6(ip) => {
                let octets = ip.octets();
                do_gen!(buf,
                    gen_be_u8!(IPV6_FAMILY) >>
                    gen_slice!(&octets[..]) >>
                    gen_be_u16!(self.port())
                )
            },
        }
    }
}

/// Generate a test that serializes a value, parses it back and compares both.
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            let value = $value;
            let mut buf = [0; 4096];
            let (_, size) = $crate::ToBytes::to_bytes(&value, (&mut buf, 0)).unwrap();
            assert!(size <= 4096);
            let (rest, decoded_value) = $crate::FromBytes::from_bytes(&buf[..size]).unwrap();
            // this helps compiler to infer type of decoded_value
            // i.e. it means that decoded_value has the same type as value
            if false {
                assert_eq!(value, decoded_value);
            }
            assert!(rest.is_empty());
            assert_eq!(decoded_value, value);
        }
    )
);
