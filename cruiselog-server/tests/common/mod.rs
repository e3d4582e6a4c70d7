#![allow(dead_code)]

use async_trait::async_trait;
use cruiselog_core::{FleetConfig, InstrumentId, Record, SinkKind, SinkSpec};
use cruiselog_server::orchestrator::Orchestrator;
use cruiselog_server::sink::{Sink, SinkError, SinkFactory};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn send(port: u16, payload: &str) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .send_to(payload.as_bytes(), ("127.0.0.1", port))
        .unwrap();
}

/// One record as seen by a sink built by [`CountingFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Distinct for every sink the factory created
    pub sink: u64,
    pub kind: SinkKind,
    pub instrument: InstrumentId,
    pub payload: String,
}

/// Builds in-memory sinks that log every record they accept.
#[derive(Default)]
pub struct CountingFactory {
    next: AtomicU64,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl CountingFactory {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivered(&self, instrument: &str, kind: SinkKind) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.instrument.as_str() == instrument && d.kind == kind)
            .collect()
    }

    pub fn created(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

struct CountingSink {
    sink: u64,
    kind: SinkKind,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

#[async_trait]
impl Sink for CountingSink {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        self.deliveries.lock().unwrap().push(Delivery {
            sink: self.sink,
            kind: self.kind,
            instrument: record.instrument.clone(),
            payload: record.payload_text(),
        });
        Ok(())
    }
}

impl SinkFactory for CountingFactory {
    fn create(&self, _instrument: &InstrumentId, spec: &SinkSpec) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(CountingSink {
            sink: self.next.fetch_add(1, Ordering::SeqCst),
            kind: spec.kind(),
            deliveries: self.deliveries.clone(),
        }))
    }
}

pub fn orchestrator(json: &str, factory: Arc<dyn SinkFactory>) -> Orchestrator {
    let fleet = FleetConfig::from_json_str(json).unwrap();
    Orchestrator::new(fleet, factory, IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
