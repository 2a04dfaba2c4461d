/*! ExtendedCell
*/

use porc_binary_io::*;

use nom::bytes::complete::tag;

use crate::bootstrap::Status;

/// Tag of [`ExtendedCell`].
pub const EXTENDED_CELL_TAG: u8 = 0x03;

/** Answer of the final hop to an [`ExtendCell`](./struct.ExtendCell.html).

Serialized form:

Length | Content
------ | ------
`1`    | `0x03`
`1`    | Status

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendedCell {
    /// Whether the circuit was extended.
    pub status: Status,
}

impl FromBytes for ExtendedCell {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[EXTENDED_CELL_TAG][..])(input)?;
        let (input, status) = Status::from_bytes(input)?;
        Ok((input, ExtendedCell { status }))
    }
}

impl ToBytes for ExtendedCell {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(EXTENDED_CELL_TAG) >>
            gen_be_u8!(self.status.as_byte())
        )
    }
}
