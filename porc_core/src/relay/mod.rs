/*! Relay node: secured transport, session registries, bootstrap handshake,
acceptor and forwarding loop.

*/

pub mod acceptor;
pub mod bootstrap;
pub mod client;
pub mod codec;
pub mod destination;
pub mod errors;
pub mod extend;
pub mod forwarding;
pub mod handshake;
pub mod registry;
pub mod secure;
pub mod server;
pub mod session;

pub use self::server::{Relay, RelayContext};
