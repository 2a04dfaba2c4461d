/*! Relay cells, the innermost payload of a circuit.

A client wraps a cell into one onion layer per hop. The final hop removes the
last layer and acts on the cell; data coming back from the destination is
wrapped into a [`DataCell`] before the final hop adds its layer.
*/

mod data;
mod extend;
mod extended;

pub use self::data::DataCell;
pub use self::extend::ExtendCell;
pub use self::extended::ExtendedCell;

use porc_binary_io::*;
use porc_crypto::LAYER_OVERHEAD;

use nom::branch::alt;
use nom::combinator::map;

use crate::relay::MAX_RELAY_FRAME_PAYLOAD_SIZE;

/// Maximum number of hops a circuit may have.
pub const MAX_CIRCUIT_HOPS: usize = 8;

/// Maximum amount of destination data put into one [`DataCell`] so the cell
/// still fits a relay frame after all upstream hops added their layers.
pub const MAX_DATA_CELL_PAYLOAD_SIZE: usize = MAX_RELAY_FRAME_PAYLOAD_SIZE - 1 - MAX_CIRCUIT_HOPS * LAYER_OVERHEAD;

/// Fully decoded payload of a circuit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelayCell {
    /// [`DataCell`](./struct.DataCell.html) structure.
    Data(DataCell),
    /// [`ExtendCell`](./struct.ExtendCell.html) structure.
    Extend(ExtendCell),
    /// [`ExtendedCell`](./struct.ExtendedCell.html) structure.
    Extended(ExtendedCell),
}

impl FromBytes for RelayCell {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(DataCell::from_bytes, RelayCell::Data),
            map(ExtendCell::from_bytes, RelayCell::Extend),
            map(ExtendedCell::from_bytes, RelayCell::Extended),
        ))(input)
    }
}

impl ToBytes for RelayCell {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match *self {
            RelayCell::Data(ref p) => p.to_bytes(buf),
            RelayCell::Extend(ref p) => p.to_bytes(buf),
            RelayCell::Extended(ref p) => p.to_bytes(buf),
        }
    }
}

impl RelayCell {
    /// Serialize the cell into a new buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>, GenError> {
        let mut buf = [0; MAX_RELAY_FRAME_PAYLOAD_SIZE];
        let (_, size) = self.to_bytes((&mut buf, 0))?;
        Ok(buf[..size].to_vec())
    }
}
