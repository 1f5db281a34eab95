/// Benchmarks for inbound message dispatch: transport notification to subscriber.
///
/// Covers the keepalive fast path (consumed, never broadcast) against ordinary text and binary
/// payloads that are forwarded to every subscriber.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use resilient_ws::transport::{
    ConnectRequest, Connector, Payload, ReadyState, Transport, TransportEvent, TransportEvents,
};
use resilient_ws::{ConnectionConfig, ConnectionSupervisor, Event, KeepaliveConfig, Result};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const BATCH: usize = 1_000;
const SENTINEL: &str = "__sentinel__";

#[derive(Clone, Default)]
struct BenchConnector {
    sockets: Arc<Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>>,
}

struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _payload: Payload) -> Result<()> {
        Ok(())
    }

    fn close(&self, _code: Option<u16>, _reason: Option<&str>) {}

    fn buffered_amount(&self) -> usize {
        0
    }

    fn extensions(&self) -> String {
        String::new()
    }

    fn protocol(&self) -> String {
        String::new()
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::Open
    }

    fn url(&self) -> String {
        String::new()
    }
}

impl Connector for BenchConnector {
    type Transport = NullTransport;

    fn connect(&self, _request: ConnectRequest<'_>) -> Result<(NullTransport, TransportEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.lock().expect("lock").push(tx);
        Ok((NullTransport, rx))
    }
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("supervisor/dispatch");
    let runtime = Runtime::new().expect("runtime");

    let payloads = [
        ("keepalive", Payload::from("ka")),
        ("text_64b", Payload::from("x".repeat(64))),
        ("binary_1kb", Payload::from(vec![0xAB_u8; 1024])),
    ];

    for (name, payload) in payloads {
        let (supervisor, socket, mut rx) = runtime.block_on(async {
            // Keep the keepalive path active without letting a countdown expire mid-run.
            let keepalive = KeepaliveConfig::builder()
                .interval(Duration::from_secs(3600))
                .build();
            let config = ConnectionConfig::new("ws://bench").with_keepalive(keepalive);
            let connector = BenchConnector::default();
            let supervisor =
                ConnectionSupervisor::new(config, connector.clone()).expect("supervisor");
            let mut rx = supervisor.subscribe();
            let socket = connector
                .sockets
                .lock()
                .expect("lock")
                .last()
                .cloned()
                .expect("socket");

            socket.send(TransportEvent::Open).expect("open");
            assert!(matches!(rx.recv().await, Ok(Event::Connected)), "connected");
            (supervisor, socket, rx)
        });

        group.throughput(Throughput::Bytes((payload.len() * BATCH) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &payload, |b, payload| {
            b.iter(|| {
                runtime.block_on(async {
                    for _ in 0..BATCH {
                        socket
                            .send(TransportEvent::Message(std::hint::black_box(payload.clone())))
                            .expect("send");
                    }
                    socket
                        .send(TransportEvent::Message(Payload::from(SENTINEL)))
                        .expect("send");

                    loop {
                        match rx.recv().await.expect("recv") {
                            Event::Message(Payload::Text(text)) if text == SENTINEL => break,
                            event => drop(std::hint::black_box(event)),
                        }
                    }
                });
            });
        });

        supervisor.close(None, None).expect("close");
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
