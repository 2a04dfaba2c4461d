/*! The implementation of circuit id
*/

use std::fmt;
use std::num::NonZeroU32;

use porc_binary_io::*;

use nom::combinator::map_opt;
use nom::number::complete::be_u32;

/// Id a relay assigns to one hop of a circuit. `0` is reserved on the wire
/// for "no circuit".
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CircuitId(NonZeroU32);

impl CircuitId {
    /// Create a circuit id, returns `None` for `0`.
    pub fn new(id: u32) -> Option<CircuitId> {
        NonZeroU32::new(id).map(CircuitId)
    }

    /// Numeric value of the id.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl From<NonZeroU32> for CircuitId {
    fn from(id: NonZeroU32) -> Self {
        CircuitId(id)
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromBytes for CircuitId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map_opt(be_u32, CircuitId::new)(input)
    }
}

impl ToBytes for CircuitId {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_be_u32!(self.get()))
    }
}
