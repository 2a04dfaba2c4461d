/*! PubKeyRequest record
*/

use porc_binary_io::*;

use nom::bytes::complete::tag;
use nom::number::complete::be_u32;

use crate::relay::CircuitId;

/// Command asking the relay for its public key.
pub const PUB_KEY_ASK: u8 = 0x01;

/// Size of a serialized [`PubKeyRequest`].
pub const PUB_KEY_REQUEST_SIZE: usize = 5;

/** First record sent by a client once the secured transport is up.

`predecessor` is the circuit id the previous relay assigned to this circuit
when the request comes from a relay extending a circuit. Clients connecting
directly leave it empty.

Serialized form:

Length | Content
------ | ------
`1`    | `0x01` (ask for public key)
`4`    | Predecessor circuit id in BigEndian, `0` if none

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PubKeyRequest {
    /// Circuit id of the previous hop.
    pub predecessor: Option<CircuitId>,
}

impl FromBytes for PubKeyRequest {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[PUB_KEY_ASK][..])(input)?;
        let (input, predecessor) = be_u32(input)?;
        Ok((input, PubKeyRequest { predecessor: CircuitId::new(predecessor) }))
    }
}

impl ToBytes for PubKeyRequest {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(PUB_KEY_ASK) >>
            gen_be_u32!(self.predecessor.map_or(0, CircuitId::get))
        )
    }
}
