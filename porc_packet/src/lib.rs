/*! Wire records of the porc relay protocol.

- [`bootstrap`] records turn a secured connection into a keyed circuit hop;
- [`relay`] frames carry onion payload along a circuit;
- [`cell`]s are what remains of a downstream payload once the last layer is
  removed at the final hop.
*/

#![forbid(unsafe_code)]
// Remove it when it will be fixed in nom parser
#![allow(clippy::redundant_closure)]

#[macro_use]
extern crate cookie_factory;

pub mod bootstrap;
pub mod cell;
pub mod relay;
