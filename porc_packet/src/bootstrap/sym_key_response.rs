/*! SymKeyResponse record
*/

use porc_binary_io::*;
use porc_crypto::*;

use super::Status;

/// Size of a serialized [`SymKeyResponse`].
pub const SYM_KEY_RESPONSE_SIZE: usize = 1 + SEALED_KEY_SIZE;

/** Client record carrying the hop key sealed to the relay public key received
in [`PubKeyResponse`](./struct.PubKeyResponse.html).

Serialized form:

Length | Content
------ | ------
`1`    | Status
`104`  | Sealed hop key

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymKeyResponse {
    /// Status of the client side. Anything but success aborts the bootstrap.
    pub status: Status,
    /// Hop key sealed with [`seal_key`](../../porc_crypto/fn.seal_key.html).
    pub sealed_key: SealedKey,
}

impl FromBytes for SymKeyResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, status) = Status::from_bytes(input)?;
        let (input, sealed_key) = SealedKey::from_bytes(input)?;
        Ok((input, SymKeyResponse { status, sealed_key }))
    }
}

impl ToBytes for SymKeyResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.status.as_byte()) >>
            gen_slice!(&self.sealed_key[..])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        sym_key_response_encode_decode,
        SymKeyResponse {
            status: Status::Success,
            sealed_key: [42; SEALED_KEY_SIZE],
        }
    );

    #[test]
    fn sym_key_response_size() {
        let response = SymKeyResponse {
            status: Status::Failure,
            sealed_key: [0; SEALED_KEY_SIZE],
        };
        let mut buf = [0; 256];
        let (_, size) = response.to_bytes((&mut buf, 0)).unwrap();
        assert_eq!(size, SYM_KEY_RESPONSE_SIZE);
        assert_eq!(buf[0], super::super::STATUS_FAILURE);
    }
}
