/*! ExtendCell
*/

use std::net::SocketAddr;

use porc_binary_io::*;
use porc_crypto::*;

use nom::bytes::complete::tag;

/// Tag of [`ExtendCell`].
pub const EXTEND_CELL_TAG: u8 = 0x02;

/** Asks the final hop to extend the circuit to one more relay.

The hop connects to `addr`, checks that the relay there owns `relay_pk` and
hands it `sealed_key`, which only that relay can open. On success the hop
becomes intermediate and answers with an
[`ExtendedCell`](./struct.ExtendedCell.html).

Serialized form:

Length      | Content
----------- | ------
`1`         | `0x02`
`7` or `19` | Socket address of the next relay
`32`        | Public key of the next relay
`104`       | Hop key sealed to the next relay

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendCell {
    /// Address of the next relay.
    pub addr: SocketAddr,
    /// Expected public key of the next relay.
    pub relay_pk: PublicKey,
    /// Hop key of the next relay sealed to `relay_pk`.
    pub sealed_key: SealedKey,
}

impl FromBytes for ExtendCell {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[EXTEND_CELL_TAG][..])(input)?;
        let (input, addr) = SocketAddr::from_bytes(input)?;
        let (input, relay_pk) = PublicKey::from_bytes(input)?;
        let (input, sealed_key) = SealedKey::from_bytes(input)?;
        Ok((input, ExtendCell { addr, relay_pk, sealed_key }))
    }
}

impl ToBytes for ExtendCell {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(EXTEND_CELL_TAG) >>
            gen_call!(|buf, addr| SocketAddr::to_bytes(addr, buf), &self.addr) >>
            gen_slice!(self.relay_pk.as_ref()) >>
            gen_slice!(&self.sealed_key[..])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    encode_decode_test!(
        extend_cell_encode_decode,
        ExtendCell {
            addr: "127.0.0.1:12345".parse().unwrap(),
            relay_pk: SecretKey::generate(&mut thread_rng()).public_key(),
            sealed_key: [42; SEALED_KEY_SIZE],
        }
    );

    encode_decode_test!(
        extend_cell_ipv6_encode_decode,
        ExtendCell {
            addr: "[::1]:12345".parse().unwrap(),
            relay_pk: SecretKey::generate(&mut thread_rng()).public_key(),
            sealed_key: [7; SEALED_KEY_SIZE],
        }
    );

    #[test]
    fn extend_cell_truncated() {
        let cell = ExtendCell {
            addr: "127.0.0.1:12345".parse().unwrap(),
            relay_pk: SecretKey::generate(&mut thread_rng()).public_key(),
            sealed_key: [42; SEALED_KEY_SIZE],
        };
        let mut buf = [0; 256];
        let (_, size) = cell.to_bytes((&mut buf, 0)).unwrap();
        assert!(ExtendCell::from_bytes(&buf[..size - 1]).is_err());
    }
}
