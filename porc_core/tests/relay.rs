use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use porc_binary_io::*;
use porc_core::relay::bootstrap::negotiate;
use porc_core::relay::client::*;
use porc_core::relay::codec::to_record;
use porc_core::relay::destination::{DestinationConnector, NoDestination, TcpDestination};
use porc_core::relay::errors::ClientError;
use porc_core::relay::session::{CircuitSession, Sessions};
use porc_core::relay::{Relay, RelayContext};
use porc_crypto::*;
use porc_packet::bootstrap::BootstrapResponse;
use porc_packet::cell::*;
use porc_packet::relay::*;
use rand::thread_rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestRelay {
    addr: SocketAddr,
    pk: PublicKey,
    sessions: Sessions,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestRelay {
    async fn start(connector: Arc<dyn DestinationConnector>) -> TestRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Relay::new(RelayContext::new(SecretKey::generate(&mut thread_rng())), connector);
        let pk = relay.context().pk().clone();
        let sessions = relay.sessions().clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            relay.run(listener, token).await.unwrap();
        });
        TestRelay { addr, pk, sessions, shutdown, handle }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
        assert_eq!(self.sessions.transports_count().await, 0);
    }
}

fn client_keys() -> (PublicKey, SecretKey) {
    let sk = SecretKey::generate(&mut thread_rng());
    (sk.public_key(), sk)
}

async fn echo_destination() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0; 1024];
                loop {
                    let size = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(size) => size,
                    };
                    if stream.write_all(&buf[..size]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, handle)
}

#[tokio::test]
async fn bootstrap_registers_circuit() {
    let relay = TestRelay::start(Arc::new(NoDestination)).await;
    let (client_pk, client_sk) = client_keys();

    let mut stream = connect_relay(relay.addr, &relay.pk, &client_pk, &client_sk).await.unwrap();
    let pk = request_public_key(&mut stream, None).await.unwrap();
    assert_eq!(pk, relay.pk);

    let key = LayerKey::generate();
    let circuit_id = send_sealed_key(&mut stream, seal_key(&pk, &key).unwrap()).await.unwrap();

    let (predecessor, stored_key, is_final) = relay.sessions.with_circuit(circuit_id, |c: &CircuitSession| {
        (c.predecessor(), c.key().clone(), c.is_final())
    }).await.unwrap();
    assert_eq!(predecessor, None);
    assert_eq!(stored_key, key);
    assert!(is_final);

    relay.stop().await;
}

#[tokio::test]
async fn unknown_command_closes_connection() {
    let relay = TestRelay::start(Arc::new(NoDestination)).await;
    let (client_pk, client_sk) = client_keys();

    let mut stream = connect_relay(relay.addr, &relay.pk, &client_pk, &client_sk).await.unwrap();
    stream.send(vec![0x7f, 0, 0, 0, 0]).await.unwrap();
    assert!(matches!(stream.next().await, None | Some(Err(_))));
    assert!(relay.sessions.circuit_ids().await.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn data_through_two_relays() {
    let (destination, destination_handle) = echo_destination().await;
    let entry = TestRelay::start(Arc::new(NoDestination)).await;
    let exit = TestRelay::start(Arc::new(TcpDestination::new(destination))).await;
    let (client_pk, client_sk) = client_keys();

    let mut circuit = OnionCircuit::connect(entry.addr, &entry.pk, &client_pk, &client_sk).await.unwrap();
    circuit.extend(exit.addr, exit.pk.clone()).await.unwrap();
    assert_eq!(circuit.hops(), 2);

    circuit.send_data(b"over two hops").await.unwrap();
    let mut echoed = Vec::new();
    while echoed.len() < 13 {
        echoed.extend(circuit.recv_data().await.unwrap());
    }
    assert_eq!(echoed, b"over two hops".to_vec());

    // the exit relay knows the circuit by the entry relay's id
    let exit_circuits = exit.sessions.circuit_ids().await;
    assert_eq!(exit_circuits.len(), 1);
    let predecessor = exit.sessions.with_circuit(exit_circuits[0], CircuitSession::predecessor).await.unwrap();
    assert_eq!(predecessor, Some(circuit.circuit_id()));

    entry.stop().await;
    exit.stop().await;
    destination_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn data_through_two_relays_on_worker_threads() {
    let (destination, destination_handle) = echo_destination().await;
    let entry = TestRelay::start(Arc::new(NoDestination)).await;
    let exit = TestRelay::start(Arc::new(TcpDestination::new(destination))).await;
    let (client_pk, client_sk) = client_keys();

    let mut circuits = Vec::new();
    for _ in 0..4 {
        let mut circuit = OnionCircuit::connect(entry.addr, &entry.pk, &client_pk, &client_sk).await.unwrap();
        circuit.extend(exit.addr, exit.pk.clone()).await.unwrap();
        circuits.push(circuit);
    }

    for (i, circuit) in circuits.iter_mut().enumerate() {
        let data = format!("circuit {}", i).into_bytes();
        circuit.send_data(&data).await.unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < data.len() {
            echoed.extend(circuit.recv_data().await.unwrap());
        }
        assert_eq!(echoed, data);
    }
    assert_eq!(exit.sessions.circuit_ids().await.len(), 4);

    entry.stop().await;
    exit.stop().await;
    destination_handle.abort();
}

#[tokio::test]
async fn each_hop_removes_one_layer() {
    let entry = TestRelay::start(Arc::new(NoDestination)).await;
    let next_sk = SecretKey::generate(&mut thread_rng());
    let next_context = RelayContext::new(next_sk);
    let next_pk = next_context.pk().clone();
    let next_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let next_addr = next_listener.local_addr().unwrap();
    let (client_pk, client_sk) = client_keys();

    let next_circuit_id = CircuitId::new(77).unwrap();
    let next_relay = tokio::spawn(async move {
        let (stream, _) = next_listener.accept().await.unwrap();
        let mut negotiated = negotiate(stream, &next_context).await.unwrap();
        let record = to_record(&BootstrapResponse { circuit_id: next_circuit_id }).unwrap();
        negotiated.stream.send(record).await.unwrap();

        let frame = read_frame(&mut negotiated.stream).await.unwrap();
        assert_eq!(frame.direction, Direction::Downstream);
        assert_eq!(frame.circuit_id, next_circuit_id);
        // only the next hop's layer is left
        let cell = negotiated.key.remove_layer(&frame.payload).unwrap();
        let (_, cell) = RelayCell::from_bytes(&cell).unwrap();
        assert_eq!(cell, RelayCell::Data(DataCell { data: b"ping".to_vec() }));

        let reply = RelayCell::Data(DataCell { data: b"pong".to_vec() }).to_vec().unwrap();
        let frame = RelayFrame {
            direction: Direction::Upstream,
            circuit_id: next_circuit_id,
            payload: negotiated.key.add_layer(&reply).unwrap(),
        };
        send_frame(&mut negotiated.stream, &frame).await.unwrap();
        (negotiated.predecessor, negotiated.stream)
    });

    let mut circuit = OnionCircuit::connect(entry.addr, &entry.pk, &client_pk, &client_sk).await.unwrap();
    circuit.extend(next_addr, next_pk).await.unwrap();
    circuit.send_data(b"ping").await.unwrap();
    assert_eq!(circuit.recv_data().await.unwrap(), b"pong".to_vec());

    let (predecessor, _next_stream) = next_relay.await.unwrap();
    assert_eq!(predecessor, Some(circuit.circuit_id()));
    assert_eq!(entry.sessions.circuit_ids().await, vec![circuit.circuit_id()]);

    entry.stop().await;
}

#[tokio::test]
async fn extend_to_unreachable_relay_is_rejected() {
    let entry = TestRelay::start(Arc::new(NoDestination)).await;
    let (client_pk, client_sk) = client_keys();

    let dead_addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let dead_pk = SecretKey::generate(&mut thread_rng()).public_key();

    let mut circuit = OnionCircuit::connect(entry.addr, &entry.pk, &client_pk, &client_sk).await.unwrap();
    let res = circuit.extend(dead_addr, dead_pk).await;
    assert!(matches!(res, Err(ClientError::ExtendRejected)));
    assert_eq!(circuit.hops(), 1);

    let is_final = entry.sessions.with_circuit(circuit.circuit_id(), CircuitSession::is_final).await;
    assert_eq!(is_final, Some(true));

    entry.stop().await;
}

#[tokio::test]
async fn broken_circuit_does_not_affect_others() {
    let (destination, destination_handle) = echo_destination().await;
    let relay = TestRelay::start(Arc::new(TcpDestination::new(destination))).await;
    let (client_pk, client_sk) = client_keys();

    let mut good = OnionCircuit::connect(relay.addr, &relay.pk, &client_pk, &client_sk).await.unwrap();
    let bad = OnionCircuit::connect(relay.addr, &relay.pk, &client_pk, &client_sk).await.unwrap();
    let bad_circuit_id = bad.circuit_id();

    // payload not sealed with the hop key
    let mut bad_stream = bad.into_stream();
    let frame = RelayFrame {
        direction: Direction::Downstream,
        circuit_id: bad_circuit_id,
        payload: vec![0; 100],
    };
    send_frame(&mut bad_stream, &frame).await.unwrap();
    assert!(matches!(bad_stream.next().await, None | Some(Err(_))));

    good.send_data(b"still here").await.unwrap();
    let mut echoed = Vec::new();
    while echoed.len() < 10 {
        echoed.extend(good.recv_data().await.unwrap());
    }
    assert_eq!(echoed, b"still here".to_vec());
    assert_eq!(relay.sessions.circuit_ids().await, vec![good.circuit_id()]);

    relay.stop().await;
    destination_handle.abort();
}

#[tokio::test]
async fn concurrent_bootstraps_get_distinct_ids() {
    let relay = TestRelay::start(Arc::new(NoDestination)).await;

    let circuits = futures::future::join_all((0..8).map(|_| {
        let (client_pk, client_sk) = client_keys();
        let addr = relay.addr;
        let relay_pk = relay.pk.clone();
        async move {
            OnionCircuit::connect(addr, &relay_pk, &client_pk, &client_sk).await.unwrap()
        }
    })).await;

    let mut ids = circuits.iter().map(OnionCircuit::circuit_id).collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(relay.sessions.transports_count().await, 8);

    relay.stop().await;
}

#[tokio::test]
async fn client_disconnect_closes_circuit() {
    let relay = TestRelay::start(Arc::new(NoDestination)).await;
    let (client_pk, client_sk) = client_keys();

    let circuit = OnionCircuit::connect(relay.addr, &relay.pk, &client_pk, &client_sk).await.unwrap();
    drop(circuit);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !relay.sessions.circuit_ids().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }).await.unwrap();

    relay.stop().await;
}
