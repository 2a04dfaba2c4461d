/*! PubKeyResponse record
*/

use porc_binary_io::*;
use porc_crypto::*;

use super::Status;

/// Size of a serialized [`PubKeyResponse`].
pub const PUB_KEY_RESPONSE_SIZE: usize = 1 + crypto_box::KEY_SIZE;

/** Relay answer to [`PubKeyRequest`](./struct.PubKeyRequest.html) carrying
the key the client must seal its hop key to.

Serialized form:

Length | Content
------ | ------
`1`    | Status
`32`   | Public key of the relay

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PubKeyResponse {
    /// Whether the request was accepted.
    pub status: Status,
    /// Public key of the relay.
    pub pk: PublicKey,
}

impl FromBytes for PubKeyResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, status) = Status::from_bytes(input)?;
        let (input, pk) = PublicKey::from_bytes(input)?;
        Ok((input, PubKeyResponse { status, pk }))
    }
}

impl ToBytes for PubKeyResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.status.as_byte()) >>
            gen_slice!(self.pk.as_ref())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    encode_decode_test!(
        pub_key_response_encode_decode,
        PubKeyResponse {
            status: Status::Success,
            pk: SecretKey::generate(&mut thread_rng()).public_key(),
        }
    );

    #[test]
    fn pub_key_response_size() {
        let response = PubKeyResponse {
            status: Status::Success,
            pk: SecretKey::generate(&mut thread_rng()).public_key(),
        };
        let mut buf = [0; 64];
        let (_, size) = response.to_bytes((&mut buf, 0)).unwrap();
        assert_eq!(size, PUB_KEY_RESPONSE_SIZE);
    }
}
