/*! Readiness-driven forwarding loop.

One task waits until any transport or destination socket becomes readable,
a wake event arrives or shutdown is requested. It then drains every ready
socket and routes what it read:

- downstream frames lose one onion layer and go to the next relay, or to the
  destination when this relay is the final hop;
- upstream frames gain one onion layer and go to the previous hop;
- destination data is wrapped into a data cell and sent upstream.

Failures close at most the one session they belong to.
*/

use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use porc_binary_io::*;
use porc_packet::bootstrap::Status;
use porc_packet::cell::*;
use porc_packet::relay::*;
use log::Level;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::relay::codec::to_record;
use crate::relay::destination::DestinationConnector;
use crate::relay::errors::{ExtendError, ForwardError, SendRecordError};
use crate::relay::extend::{extend_circuit, ExtendedHop};
use crate::relay::server::RelayContext;
use crate::relay::session::*;

/// Time allowed to connect a destination.
pub const DESTINATION_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of data cells kept for a circuit while its destination
/// is connecting.
pub const MAX_QUEUED_CELLS: usize = 64;

/// Event delivered to the forwarding loop from other tasks.
pub enum LoopEvent {
    /// Sessions were added, the readiness set has to be rebuilt.
    Wake,
    /// Extension of a circuit finished.
    Extended {
        /// Circuit that was extended.
        circuit_id: CircuitId,
        /// Next hop or the reason it couldn't be created.
        result: Result<ExtendedHop, ExtendError>,
    },
    /// Connect of a circuit's destination finished.
    DestinationConnected {
        /// Circuit the destination belongs to.
        circuit_id: CircuitId,
        /// Connected stream or the reason it couldn't be connected.
        result: Result<TcpStream, IoError>,
    },
}

enum Wakeup {
    Shutdown,
    Event(LoopEvent),
    Ready(Vec<(Watched, Result<(), IoError>)>),
}

enum Downstream {
    Relay {
        transport: TransportId,
        frame: RelayFrame,
    },
    Deliver {
        destination: Option<DestinationId>,
        cell: Vec<u8>,
    },
}

/// Routes frames between the sessions of a relay.
pub struct ForwardingLoop {
    context: Arc<RelayContext>,
    sessions: Sessions,
    connector: Arc<dyn DestinationConnector>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    /// Data cells of circuits whose destination is connecting.
    connecting: HashMap<CircuitId, Vec<Vec<u8>>>,
}

impl ForwardingLoop {
    /// Create the loop. `events_tx` is handed to extension tasks, other
    /// senders of the same channel wake the loop.
    pub fn new(
        context: Arc<RelayContext>,
        sessions: Sessions,
        connector: Arc<dyn DestinationConnector>,
        events_tx: mpsc::UnboundedSender<LoopEvent>,
        events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    ) -> ForwardingLoop {
        ForwardingLoop {
            context,
            sessions,
            connector,
            events_tx,
            events_rx,
            connecting: HashMap::new(),
        }
    }

    /// Forward until `shutdown` is cancelled, then close every session.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            match self.wait(&shutdown).await {
                Wakeup::Shutdown => break,
                Wakeup::Event(event) => self.handle_event(event).await,
                Wakeup::Ready(ready) => {
                    for (watched, res) in ready {
                        self.handle_ready(watched, res).await;
                    }
                },
            }
        }

        self.sessions.close_all().await;
        info!("Forwarding loop stopped");
    }

    async fn wait(&mut self, shutdown: &CancellationToken) -> Wakeup {
        let mut readiness = self.sessions.readiness_set().await
            .into_iter()
            .map(|(watched, socket)| async move {
                let res = socket.readable().await;
                (watched, res)
            })
            .collect::<FuturesUnordered<_>>();

        let first = tokio::select! {
            _ = shutdown.cancelled() => return Wakeup::Shutdown,
            event = self.events_rx.next() => return match event {
                Some(event) => Wakeup::Event(event),
                None => Wakeup::Shutdown,
            },
            Some(ready) = readiness.next(), if !readiness.is_empty() => ready,
        };

        let mut ready = vec![first];
        while let Some(Some(next)) = readiness.next().now_or_never() {
            ready.push(next);
        }
        Wakeup::Ready(ready)
    }

    async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Wake => trace!("Forwarding loop woken up"),
            LoopEvent::Extended { circuit_id, result: Ok(hop) } => self.finish_extension(circuit_id, hop).await,
            LoopEvent::Extended { circuit_id, result: Err(e) } => {
                warn!("Failed to extend circuit {}: {}", circuit_id, e);
                self.sessions.with_circuit_mut(circuit_id, CircuitSession::cancel_extending).await;
                self.reply_extended(circuit_id, Status::Failure).await;
            },
            LoopEvent::DestinationConnected { circuit_id, result } => self.finish_destination(circuit_id, result).await,
        }
    }

    async fn handle_ready(&mut self, watched: Watched, res: Result<(), IoError>) {
        match (watched, res) {
            (Watched::Transport(id), Ok(())) => self.on_transport_readable(id).await,
            (Watched::Destination(id), Ok(())) => self.on_destination_readable(id).await,
            (Watched::Transport(id), Err(e)) => {
                warn!("Transport {} failed: {}", id, e);
                self.sessions.close_transport(id).await;
            },
            (Watched::Destination(id), Err(e)) => {
                warn!("Destination {} failed: {}", id, e);
                self.sessions.close_destination(id).await;
            },
        }
    }

    async fn on_transport_readable(&mut self, id: TransportId) {
        // closed earlier in this iteration
        let inbound = match self.sessions.inbound(id).await {
            Some(inbound) => inbound,
            None => return,
        };

        let received = inbound.lock().await.read_records();
        match received {
            Ok(received) => {
                for record in received.records {
                    self.handle_record(id, record).await;
                }
                if received.closed {
                    info!("Transport {} closed by peer", id);
                    self.sessions.close_transport(id).await;
                }
            },
            Err(e) => {
                warn!("Failed to read from transport {}: {}", id, e);
                self.sessions.close_transport(id).await;
            },
        }
    }

    async fn on_destination_readable(&mut self, id: DestinationId) {
        let (circuit_id, socket) = match self.sessions.destination_reader(id).await {
            Some(reader) => reader,
            None => return,
        };

        let mut buf = vec![0; MAX_DATA_CELL_PAYLOAD_SIZE];
        match socket.try_read(&mut buf) {
            Ok(0) => {
                info!("Destination {} of circuit {} closed", id, circuit_id);
                self.sessions.close_destination(id).await;
            },
            Ok(size) => {
                buf.truncate(size);
                let cell = RelayCell::Data(DataCell { data: buf });
                if let Err(e) = self.send_upstream_cell(circuit_id, &cell).await {
                    self.handle_error(e).await;
                }
            },
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {},
            Err(e) => {
                warn!("Failed to read from destination {}: {}", id, e);
                self.sessions.close_destination(id).await;
            },
        }
    }

    async fn handle_record(&mut self, from: TransportId, record: Vec<u8>) {
        let res = match RelayFrame::parse(&record) {
            Ok(frame) => match frame.direction {
                Direction::Downstream => self.forward_downstream(from, frame).await,
                Direction::Upstream => self.forward_upstream(from, frame).await,
            },
            Err(error) => Err(ForwardError::Frame { transport: from, error }),
        };
        if let Err(e) = res {
            self.handle_error(e).await;
        }
    }

    async fn forward_downstream(&mut self, from: TransportId, frame: RelayFrame) -> Result<(), ForwardError> {
        let circuit_id = frame.circuit_id;
        let route = self.sessions.with_circuit(circuit_id, |circuit| -> Result<Downstream, ForwardError> {
            if circuit.upstream_transport() != from {
                return Err(ForwardError::WrongTransport { circuit_id, transport: from })
            }
            let payload = circuit.key().remove_layer(&frame.payload)
                .map_err(|error| ForwardError::Layer { circuit_id, error })?;
            match circuit.role() {
                HopRole::Final { destination } => Ok(Downstream::Deliver { destination, cell: payload }),
                HopRole::Extending => Err(ForwardError::Extending(circuit_id)),
                HopRole::Intermediate { downstream_transport, downstream_circuit } => Ok(Downstream::Relay {
                    transport: downstream_transport,
                    frame: RelayFrame {
                        direction: Direction::Downstream,
                        circuit_id: downstream_circuit,
                        payload,
                    },
                }),
            }
        }).await.ok_or(ForwardError::NoSuchCircuit(circuit_id))??;

        match route {
            Downstream::Relay { transport, frame } => self.send_frame(transport, &frame).await,
            Downstream::Deliver { destination, cell } => self.handle_cell(circuit_id, destination, &cell).await,
        }
    }

    async fn forward_upstream(&mut self, from: TransportId, frame: RelayFrame) -> Result<(), ForwardError> {
        let circuit_id = frame.circuit_id;
        let downstream_transport = self.sessions.with_circuit(circuit_id, CircuitSession::downstream_transport).await
            .ok_or(ForwardError::NoSuchCircuit(circuit_id))?;
        if downstream_transport != Some(from) {
            return Err(ForwardError::WrongTransport { circuit_id, transport: from })
        }
        self.send_upstream(circuit_id, &frame.payload).await
    }

    async fn handle_cell(&mut self, circuit_id: CircuitId, destination: Option<DestinationId>, cell: &[u8]) -> Result<(), ForwardError> {
        let cell = RelayCell::from_bytes(cell)
            .map(|(_, cell)| cell)
            .map_err(|_| ForwardError::MalformedCell(circuit_id))?;
        match cell {
            RelayCell::Data(DataCell { data }) => self.deliver(circuit_id, destination, &data).await,
            RelayCell::Extend(cell) => self.start_extension(circuit_id, cell).await,
            RelayCell::Extended(_) => Err(ForwardError::UnexpectedCell(circuit_id)),
        }
    }

    async fn deliver(&mut self, circuit_id: CircuitId, destination: Option<DestinationId>, data: &[u8]) -> Result<(), ForwardError> {
        match destination {
            Some(destination) => self.write_destination(destination, data).await,
            None => self.queue_for_destination(circuit_id, data),
        }
    }

    async fn write_destination(&mut self, destination: DestinationId, data: &[u8]) -> Result<(), ForwardError> {
        let writer = self.sessions.destination_writer(destination).await
            .ok_or(ForwardError::NoSuchDestination(destination))?;

        let mut writer = writer.lock().await;
        timeout(SEND_TIMEOUT, writer.write_all(data)).await
            .unwrap_or_else(|_| Err(IoError::new(ErrorKind::TimedOut, "destination write timed out")))
            .map_err(|error| ForwardError::WriteDestination { destination, error })
    }

    /// Keep data for a destination that isn't connected yet. The first cell
    /// starts the connect in its own task so that a slow destination doesn't
    /// hold up other circuits.
    fn queue_for_destination(&mut self, circuit_id: CircuitId, data: &[u8]) -> Result<(), ForwardError> {
        if let Some(queued) = self.connecting.get_mut(&circuit_id) {
            if queued.len() >= MAX_QUEUED_CELLS {
                return Err(ForwardError::Backlog { circuit_id, queued: queued.len() })
            }
            queued.push(data.to_vec());
            return Ok(())
        }

        self.connecting.insert(circuit_id, vec![data.to_vec()]);
        let connect = self.connector.connect(circuit_id);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = timeout(DESTINATION_CONNECT_TIMEOUT, connect).await
                .unwrap_or_else(|_| Err(IoError::new(ErrorKind::TimedOut, "destination connect timed out")));
            if events_tx.unbounded_send(LoopEvent::DestinationConnected { circuit_id, result }).is_err() {
                debug!("Destination of circuit {} connected after shutdown", circuit_id);
            }
        });
        Ok(())
    }

    async fn finish_destination(&mut self, circuit_id: CircuitId, result: Result<TcpStream, IoError>) {
        let queued = self.connecting.remove(&circuit_id).unwrap_or_default();
        let res = match result {
            Ok(stream) => self.attach_destination(circuit_id, stream).await,
            Err(error) => Err(ForwardError::Connect { circuit_id, error }),
        };
        let destination = match res {
            Ok(destination) => destination,
            Err(e) => return self.handle_error(e).await,
        };

        for data in queued {
            if let Err(e) = self.write_destination(destination, &data).await {
                // the destination is closed by now, the rest has nowhere to go
                return self.handle_error(e).await;
            }
        }
    }

    async fn attach_destination(&mut self, circuit_id: CircuitId, stream: TcpStream) -> Result<DestinationId, ForwardError> {
        let destination = DestinationSession::new(circuit_id, stream)
            .map_err(|error| ForwardError::Connect { circuit_id, error })?;
        let addr = destination.addr();

        let id = self.sessions.insert_destination(destination).await
            .ok_or(ForwardError::NoSuchCircuit(circuit_id))?;
        info!("Destination {} connected for circuit {}", addr, circuit_id);
        Ok(id)
    }

    async fn start_extension(&mut self, circuit_id: CircuitId, cell: ExtendCell) -> Result<(), ForwardError> {
        let started = if self.connecting.contains_key(&circuit_id) {
            false
        } else {
            self.sessions.with_circuit_mut(circuit_id, CircuitSession::start_extending).await
                .ok_or(ForwardError::NoSuchCircuit(circuit_id))?
        };
        if !started {
            info!("Circuit {} has a destination, refusing to extend", circuit_id);
            let cell = RelayCell::Extended(ExtendedCell { status: Status::Failure });
            return self.send_upstream_cell(circuit_id, &cell).await
        }

        info!("Extending circuit {} to {}", circuit_id, cell.addr);
        let context = self.context.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = extend_circuit(&context, circuit_id, cell).await;
            if events_tx.unbounded_send(LoopEvent::Extended { circuit_id, result }).is_err() {
                debug!("Extension of circuit {} finished after shutdown", circuit_id);
            }
        });
        Ok(())
    }

    async fn finish_extension(&mut self, circuit_id: CircuitId, hop: ExtendedHop) {
        let ExtendedHop { transport, circuit_id: downstream_circuit } = hop;
        let transport_id = self.sessions.insert_transport(transport).await;
        let linked = self.sessions.with_circuit_mut(circuit_id, |c| c.link_downstream(transport_id, downstream_circuit)).await;
        if linked != Some(true) {
            warn!("Circuit {} closed while extending, dropping its next hop", circuit_id);
            self.sessions.close_transport(transport_id).await;
            return;
        }

        info!("Circuit {} extended over transport {} as circuit {}", circuit_id, transport_id, downstream_circuit);
        self.reply_extended(circuit_id, Status::Success).await;
    }

    async fn reply_extended(&mut self, circuit_id: CircuitId, status: Status) {
        let cell = RelayCell::Extended(ExtendedCell { status });
        if let Err(e) = self.send_upstream_cell(circuit_id, &cell).await {
            self.handle_error(e).await;
        }
    }

    async fn send_upstream_cell(&mut self, circuit_id: CircuitId, cell: &RelayCell) -> Result<(), ForwardError> {
        let cell = cell.to_vec().map_err(ForwardError::Serialize)?;
        self.send_upstream(circuit_id, &cell).await
    }

    async fn send_upstream(&mut self, circuit_id: CircuitId, payload: &[u8]) -> Result<(), ForwardError> {
        let (transport, frame) = self.sessions.with_circuit(circuit_id, |circuit| -> Result<_, ForwardError> {
            let payload = circuit.key().add_layer(payload)
                .map_err(|error| ForwardError::Layer { circuit_id, error })?;
            let frame = RelayFrame {
                direction: Direction::Upstream,
                circuit_id: circuit.upstream_circuit_id(circuit_id),
                payload,
            };
            Ok((circuit.upstream_transport(), frame))
        }).await.ok_or(ForwardError::NoSuchCircuit(circuit_id))??;

        self.send_frame(transport, &frame).await
    }

    async fn send_frame(&mut self, transport: TransportId, frame: &RelayFrame) -> Result<(), ForwardError> {
        if frame.payload.len() > MAX_RELAY_FRAME_PAYLOAD_SIZE {
            return Err(ForwardError::TooBig { circuit_id: frame.circuit_id, len: frame.payload.len() })
        }
        let record = to_record(frame)
            .map_err(|error| ForwardError::SendTransport { transport, error: SendRecordError::Encode(error) })?;
        let outbound = self.sessions.outbound(transport).await
            .ok_or(ForwardError::NoSuchTransport(transport))?;

        let res = outbound.lock().await.send_record(record).await;
        res.map_err(|error| ForwardError::SendTransport { transport, error })
    }

    async fn handle_error(&mut self, error: ForwardError) {
        match error {
            ForwardError::Layer { circuit_id, .. } | ForwardError::Connect { circuit_id, .. } => {
                warn!("{}, closing circuit {}", error, circuit_id);
                self.sessions.close_circuit(circuit_id).await;
            },
            ForwardError::SendTransport { transport, .. } => {
                warn!("{}, closing transport {}", error, transport);
                self.sessions.close_transport(transport).await;
            },
            ForwardError::WriteDestination { destination, .. } => {
                warn!("{}, closing destination {}", error, destination);
                self.sessions.close_destination(destination).await;
            },
            _ => {
                log!(drop_level(&error), "Dropping frame: {}", error);
            },
        }
    }
}

/// Level a dropped frame is reported at. Every drop reaches the operator at
/// the default filter.
fn drop_level(error: &ForwardError) -> Level {
    match error {
        ForwardError::Serialize(_) => Level::Error,
        _ => Level::Warn,
    }
}
