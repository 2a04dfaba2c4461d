/*! Where final hops deliver circuit data.
*/

use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;

use futures::future::{self, BoxFuture, FutureExt};
use porc_packet::relay::CircuitId;
use tokio::net::TcpStream;

/// Opens the destination connection of a circuit. Called by a final hop the
/// first time data has to be delivered.
pub trait DestinationConnector: Send + Sync {
    /// Connect the destination for `circuit_id`.
    fn connect(&self, circuit_id: CircuitId) -> BoxFuture<'static, Result<TcpStream, IoError>>;
}

/// Every circuit is delivered to the same TCP address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpDestination {
    addr: SocketAddr,
}

impl TcpDestination {
    /// Deliver to `addr`.
    pub fn new(addr: SocketAddr) -> TcpDestination {
        TcpDestination { addr }
    }

    /// Address data is delivered to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl DestinationConnector for TcpDestination {
    fn connect(&self, circuit_id: CircuitId) -> BoxFuture<'static, Result<TcpStream, IoError>> {
        debug!("Connecting destination {} for circuit {}", self.addr, circuit_id);
        TcpStream::connect(self.addr).boxed()
    }
}

/// Refuses every destination. Used when the relay only forwards.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoDestination;

impl DestinationConnector for NoDestination {
    fn connect(&self, _circuit_id: CircuitId) -> BoxFuture<'static, Result<TcpStream, IoError>> {
        future::ready(Err(IoError::new(ErrorKind::Unsupported, "no destination is configured"))).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_destination_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination = TcpDestination::new(listener.local_addr().unwrap());

        let stream = destination.connect(CircuitId::new(1).unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), accepted.peer_addr().unwrap());
    }

    #[tokio::test]
    async fn no_destination_refuses() {
        let res = NoDestination.connect(CircuitId::new(1).unwrap()).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
