/*! Records exchanged right after the secured transport is established.

```text
client                                    relay
  | -- PubKeyRequest {ASK, predecessor} --> |
  | <-- PubKeyResponse {SUCCESS, pk} ------ |
  | -- SymKeyResponse {SUCCESS, sealed} --> |
  | <-- BootstrapResponse {circuit_id} ---- |
```

Every record is sent as a single secured record and must have exactly the
size stated by its constant.
*/

mod bootstrap_response;
mod pub_key_request;
mod pub_key_response;
mod sym_key_response;

pub use self::bootstrap_response::*;
pub use self::pub_key_request::*;
pub use self::pub_key_response::*;
pub use self::sym_key_response::*;

use porc_binary_io::*;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::value;

/// Status of a bootstrap response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// Request was handled.
    Success,
    /// Request was rejected.
    Failure,
}

/// Byte of [`Status::Success`].
pub const STATUS_SUCCESS: u8 = 0x00;
/// Byte of [`Status::Failure`].
pub const STATUS_FAILURE: u8 = 0x01;

impl Status {
    /// Wire representation of the status.
    pub fn as_byte(self) -> u8 {
        match self {
            Status::Success => STATUS_SUCCESS,
            Status::Failure => STATUS_FAILURE,
        }
    }
}

impl FromBytes for Status {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            value(Status::Success, tag(&[STATUS_SUCCESS][..])),
            value(Status::Failure, tag(&[STATUS_FAILURE][..])),
        ))(input)
    }
}

impl ToBytes for Status {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_be_u8!(self.as_byte()))
    }
}
