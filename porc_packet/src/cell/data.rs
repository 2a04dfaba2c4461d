/*! DataCell
*/

use porc_binary_io::*;

use nom::bytes::complete::tag;
use nom::combinator::rest;

/// Tag of [`DataCell`].
pub const DATA_CELL_TAG: u8 = 0x01;

/** Application data exchanged with the destination of a circuit.

Serialized form:

Length     | Content
---------- | ------
`1`        | `0x01`
variable   | Data

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataCell {
    /// Application data.
    pub data: Vec<u8>,
}

impl FromBytes for DataCell {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[DATA_CELL_TAG][..])(input)?;
        let (input, data) = rest(input)?;
        Ok((input, DataCell { data: data.to_vec() }))
    }
}

impl ToBytes for DataCell {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(DATA_CELL_TAG) >>
            gen_slice!(self.data.as_slice())
        )
    }
}
