//! UDP listeners, one socket per port.
//!
//! The [`ListenerHub`] hands out a [`Subscription`] per instrument. All
//! instruments on the same port share one [`PortListener`]: a single reader
//! task owns the socket and routes each datagram to the instrument its
//! payload belongs to (see [`cruiselog_core::PortRoute`]). Packets for an
//! instrument that is not attached, or that belong to nobody, are dropped.
//!
//! The socket lives as long as at least one subscription does. When the last
//! subscription detaches the reader is cancelled and the socket closed.

use cruiselog_core::{InstrumentConfig, InstrumentId, Packet, PortRoute, PortRoutes};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::network;
use crate::queue::{DropOldestQueue, Pushed};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("Cannot bind UDP port {port}: {message}")]
    Bind { port: u16, message: String },
    #[error("Socket error on UDP port {port}: {message}")]
    Socket { port: u16, message: String },
    #[error("No instrument is configured on UDP port {0}")]
    NoRoute(u16),
    #[error("Instrument '{0}' is already attached to UDP port {1}")]
    AlreadyAttached(InstrumentId, u16),
}

/// Where the reader delivers packets for one instrument.
struct Consumer {
    ingress: Arc<DropOldestQueue<Packet>>,
    fault: Arc<Mutex<Option<ListenerError>>>,
}

impl Consumer {
    fn fail(&self, error: &ListenerError) {
        self.fault.lock().unwrap().get_or_insert_with(|| error.clone());
        self.ingress.close();
    }
}

type Consumers = Arc<RwLock<HashMap<InstrumentId, Consumer>>>;

/// Owns the socket of one port and its reader task.
pub struct PortListener {
    port: u16,
    consumers: Consumers,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PortListener {
    fn bind(
        bind_addr: IpAddr,
        route: PortRoute,
        max_packet_size: usize,
    ) -> Result<PortListener, ListenerError> {
        let port = route.port();
        let socket =
            network::create_udp_listen(bind_addr, port).map_err(|e| ListenerError::Bind {
                port,
                message: e.to_string(),
            })?;
        debug!("Listening on UDP {}:{}", bind_addr, port);

        let consumers: Consumers = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(
            socket,
            route,
            consumers.clone(),
            cancel.clone(),
            max_packet_size,
        ));

        Ok(PortListener {
            port,
            consumers,
            cancel,
            task: Some(task),
        })
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn remove(&self, instrument: &InstrumentId) {
        self.consumers.write().unwrap().remove(instrument);
    }

    /// Fault every consumer as if the socket had failed.
    fn fail(&self, error: ListenerError) {
        fail_consumers(&self.consumers, &error);
        self.cancel.cancel();
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("Closed UDP port {}", self.port);
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn fail_consumers(consumers: &Consumers, error: &ListenerError) {
    for consumer in consumers.read().unwrap().values() {
        consumer.fail(error);
    }
}

async fn read_loop(
    socket: UdpSocket,
    route: PortRoute,
    consumers: Consumers,
    cancel: CancellationToken,
    max_packet_size: usize,
) {
    let port = route.port();
    let mut buf = vec![0u8; max_packet_size];

    loop {
        tokio::select! { biased;
            _ = cancel.cancelled() => {
                trace!("port {}: reader cancelled", port);
                break;
            }
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, source)) => {
                        let payload = &buf[..len];
                        let Some(instrument) = route.route(payload) else {
                            trace!("port {}: {} bytes from {} match no data id, dropped", port, len, source);
                            continue;
                        };
                        let consumers = consumers.read().unwrap();
                        let Some(consumer) = consumers.get(instrument) else {
                            trace!("port {}: {} is not attached, dropped", port, instrument);
                            continue;
                        };
                        let packet = Packet::new(payload.to_vec(), source, port);
                        if let Pushed::Overflow { first: true } = consumer.ingress.push(packet) {
                            warn!("{}: ingress queue full, dropping oldest packets", instrument);
                        }
                    }
                    Err(e) => {
                        error!("port {}: socket read failed: {}", port, e);
                        let error = ListenerError::Socket { port, message: e.to_string() };
                        fail_consumers(&consumers, &error);
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
}

/// One instrument's attachment to a port.
///
/// Dropping a subscription detaches it; [`Subscription::detach`] does the
/// same but also waits for the socket to close if this was the last user.
pub struct Subscription {
    instrument: InstrumentId,
    port: u16,
    listener: Option<Arc<PortListener>>,
    ingress: Arc<DropOldestQueue<Packet>>,
    fault: Arc<Mutex<Option<ListenerError>>>,
}

impl Subscription {
    /// Packets routed to this instrument, closed on detach or socket fault.
    pub fn ingress(&self) -> Arc<DropOldestQueue<Packet>> {
        self.ingress.clone()
    }

    /// The error that closed the socket, if it failed.
    pub fn fault(&self) -> Arc<Mutex<Option<ListenerError>>> {
        self.fault.clone()
    }

    /// Stop delivery to this instrument. Packets already queued stay in the
    /// ingress queue for the pipeline to drain.
    pub async fn detach(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.remove(&self.instrument);
            self.ingress.close();
            debug!("{}: detached from UDP port {}", self.instrument, self.port);
            if let Ok(listener) = Arc::try_unwrap(listener) {
                listener.shutdown().await;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.remove(&self.instrument);
            self.ingress.close();
        }
    }
}

/// Registry of live port listeners.
pub struct ListenerHub {
    bind_addr: IpAddr,
    max_packet_size: usize,
    routes: PortRoutes,
    ports: Mutex<HashMap<u16, Weak<PortListener>>>,
}

impl ListenerHub {
    pub fn new(bind_addr: IpAddr, routes: PortRoutes, max_packet_size: usize) -> Self {
        ListenerHub {
            bind_addr,
            max_packet_size,
            routes,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Attach an instrument to its port, binding the socket if no other
    /// instrument holds it yet.
    pub fn attach(
        &self,
        instrument: &InstrumentConfig,
        ingress_capacity: usize,
    ) -> Result<Subscription, ListenerError> {
        let port = instrument.port;
        let route = self
            .routes
            .get(port)
            .ok_or(ListenerError::NoRoute(port))?;

        let mut ports = self.ports.lock().unwrap();
        ports.retain(|_, l| l.strong_count() > 0);

        let listener = match ports
            .get(&port)
            .and_then(Weak::upgrade)
            .filter(|l| !l.is_closed())
        {
            Some(listener) => listener,
            None => {
                let listener = Arc::new(PortListener::bind(
                    self.bind_addr,
                    route.clone(),
                    self.max_packet_size,
                )?);
                ports.insert(port, Arc::downgrade(&listener));
                listener
            }
        };

        let ingress = Arc::new(DropOldestQueue::new(ingress_capacity));
        let fault = Arc::new(Mutex::new(None));
        {
            let mut consumers = listener.consumers.write().unwrap();
            if consumers.contains_key(&instrument.id) {
                return Err(ListenerError::AlreadyAttached(instrument.id.clone(), port));
            }
            consumers.insert(
                instrument.id.clone(),
                Consumer {
                    ingress: ingress.clone(),
                    fault: fault.clone(),
                },
            );
        }
        debug!(
            "{}: attached to UDP port {}{}",
            instrument.id,
            port,
            if route.is_shared() { " (shared)" } else { "" }
        );

        Ok(Subscription {
            instrument: instrument.id.clone(),
            port,
            listener: Some(listener),
            ingress,
            fault,
        })
    }

    /// Ports with an open socket.
    pub fn open_ports(&self) -> Vec<u16> {
        let ports = self.ports.lock().unwrap();
        let mut open: Vec<u16> = ports
            .iter()
            .filter(|(_, l)| l.upgrade().is_some_and(|l| !l.is_closed()))
            .map(|(port, _)| *port)
            .collect();
        open.sort_unstable();
        open
    }

    /// Fail the socket on `port` as a read error would. Returns false if the
    /// port has no open socket.
    pub fn fail_port(&self, port: u16, message: &str) -> bool {
        let listener = self.ports.lock().unwrap().get(&port).and_then(Weak::upgrade);
        match listener {
            Some(listener) => {
                warn!("port {}: failing listener: {}", port, message);
                listener.fail(ListenerError::Socket {
                    port,
                    message: message.to_string(),
                });
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cruiselog_core::FleetConfig;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fleet(port: u16) -> FleetConfig {
        FleetConfig::from_json_str(&format!(
            r#"{{ "instruments": {{
                "A": {{ "port": {port}, "dataId": "A" }},
                "B": {{ "port": {port}, "dataId": "B" }}
            }} }}"#
        ))
        .unwrap()
    }

    fn hub(fleet: &FleetConfig) -> ListenerHub {
        ListenerHub::new(IpAddr::V4(Ipv4Addr::LOCALHOST), fleet.routes.clone(), 2048)
    }

    fn send(port: u16, payload: &[u8]) {
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(payload, ("127.0.0.1", port)).unwrap();
    }

    async fn next(q: &DropOldestQueue<Packet>) -> Option<Packet> {
        tokio::time::timeout(Duration::from_millis(500), q.pop())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_shared_port_demux() {
        let port = free_port();
        let fleet = fleet(port);
        let hub = hub(&fleet);
        let a = hub.attach(fleet.instrument("A").unwrap(), 16).unwrap();
        let b = hub.attach(fleet.instrument("B").unwrap(), 16).unwrap();
        assert_eq!(hub.open_ports(), vec![port]);

        send(port, b"C,0,0,0");
        send(port, b"A,1,2,3");
        send(port, b"B,4,5,6");

        let packet = next(&a.ingress()).await.unwrap();
        assert_eq!(packet.payload, b"A,1,2,3");
        assert_eq!(packet.port, port);
        let packet = next(&b.ingress()).await.unwrap();
        assert_eq!(packet.payload, b"B,4,5,6");
        assert!(a.ingress().is_empty());
        assert!(b.ingress().is_empty());
    }

    #[tokio::test]
    async fn test_unattached_instrument_drops() {
        let port = free_port();
        let fleet = fleet(port);
        let hub = hub(&fleet);
        let a = hub.attach(fleet.instrument("A").unwrap(), 16).unwrap();

        send(port, b"B,4,5,6");
        send(port, b"A,1,2,3");

        let packet = next(&a.ingress()).await.unwrap();
        assert_eq!(packet.payload, b"A,1,2,3");
    }

    #[tokio::test]
    async fn test_socket_closes_with_last_subscription() {
        let port = free_port();
        let fleet = fleet(port);
        let hub = hub(&fleet);
        let a = hub.attach(fleet.instrument("A").unwrap(), 16).unwrap();
        let b = hub.attach(fleet.instrument("B").unwrap(), 16).unwrap();
        assert!(matches!(
            hub.attach(fleet.instrument("A").unwrap(), 16),
            Err(ListenerError::AlreadyAttached(..))
        ));

        let a_ingress = a.ingress();
        a.detach().await;
        assert!(a_ingress.is_closed());
        assert_eq!(hub.open_ports(), vec![port]);

        b.detach().await;
        assert!(hub.open_ports().is_empty());

        // The port can be taken again
        let a = hub.attach(fleet.instrument("A").unwrap(), 16).unwrap();
        send(port, b"A,9");
        assert_eq!(next(&a.ingress()).await.unwrap().payload, b"A,9");
    }

    #[tokio::test]
    async fn test_bind_error() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let fleet = fleet(port);
        let hub = hub(&fleet);
        let err = hub.attach(fleet.instrument("A").unwrap(), 16).err();
        assert!(matches!(err, Some(ListenerError::Bind { .. })));
        assert!(hub.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_two_hubs_cannot_share_a_port() {
        let port = free_port();
        let fleet = fleet(port);
        let (first, second) = (hub(&fleet), hub(&fleet));
        let a = first.attach(fleet.instrument("A").unwrap(), 16).unwrap();

        let err = second.attach(fleet.instrument("B").unwrap(), 16).err();
        assert!(matches!(err, Some(ListenerError::Bind { port: p, .. }) if p == port));
        assert!(second.open_ports().is_empty());

        // The first hub keeps receiving
        send(port, b"A,1");
        assert_eq!(next(&a.ingress()).await.unwrap().payload, b"A,1");

        a.detach().await;
        let b = second.attach(fleet.instrument("B").unwrap(), 16).unwrap();
        send(port, b"B,2");
        assert_eq!(next(&b.ingress()).await.unwrap().payload, b"B,2");
    }

    #[tokio::test]
    async fn test_fault_reaches_every_consumer() {
        let port = free_port();
        let fleet = fleet(port);
        let hub = hub(&fleet);
        let a = hub.attach(fleet.instrument("A").unwrap(), 16).unwrap();
        let b = hub.attach(fleet.instrument("B").unwrap(), 16).unwrap();

        assert!(hub.fail_port(port, "cable cut"));
        assert!(a.ingress().is_closed());
        assert!(b.ingress().is_closed());
        assert!(matches!(
            *a.fault().lock().unwrap(),
            Some(ListenerError::Socket { .. })
        ));
        assert!(hub.open_ports().is_empty());

        // A failed socket is replaced on the next attach
        drop(a);
        drop(b);
        let a = hub.attach(fleet.instrument("A").unwrap(), 16).unwrap();
        assert!(!a.ingress().is_closed());
        assert_eq!(hub.open_ports(), vec![port]);
    }
}
