/*! BootstrapResponse record
*/

use porc_binary_io::*;

use nom::bytes::complete::tag;

use super::STATUS_SUCCESS;
use crate::relay::CircuitId;

/// Size of a serialized [`BootstrapResponse`].
pub const BOOTSTRAP_RESPONSE_SIZE: usize = 5;

/** Last bootstrap record, sent by the relay once the hop is registered.

The client addresses downstream frames to this relay with `circuit_id`.

Serialized form:

Length | Content
------ | ------
`1`    | `0x00` (success)
`4`    | Circuit id in BigEndian

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapResponse {
    /// Id of the circuit session created by the relay.
    pub circuit_id: CircuitId,
}

impl FromBytes for BootstrapResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[STATUS_SUCCESS][..])(input)?;
        let (input, circuit_id) = CircuitId::from_bytes(input)?;
        Ok((input, BootstrapResponse { circuit_id }))
    }
}

impl ToBytes for BootstrapResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(STATUS_SUCCESS) >>
            gen_be_u32!(self.circuit_id.get())
        )
    }
}
