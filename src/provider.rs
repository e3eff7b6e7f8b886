//! Resolves "the connection bound to logical port P" for a running flow.
//!
//! ```text
//!            accept loop (port P2)
//!                   │ assign(P2, conn)
//!                   ▼
//!  driver ──get(P2)──▶ ServerConnectionProvider ── Slot(P1) = entry connection
//!     (blocks until       │                         Slot(P2) = pending ──▶ ready
//!      P2 is ready)       └ requires_connection(P2)? true while pending
//!
//!  driver ──get(P)──▶ DialingConnectionProvider ── dial on first use, memoised
//! ```
//!
//! A provider lives as long as one logical flow instance.  The orchestrator
//! cancels it on shutdown, which wakes every driver blocked in `get` with
//! `Interrupted`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::connection::Connection;
use crate::error::FlowError;
use crate::slot::Slot;
use crate::socket::SocketFactory;

pub trait ConnectionProvider: Send + Sync {
    /// The connection for `port`, blocking until it is available.
    fn get(&self, port: u16) -> Result<Arc<Connection>, FlowError>;

    /// Hand a freshly accepted connection to a flow waiting for `port`.
    /// Returns `false` when the flow does not need it.
    fn assign(&self, _port: u16, _connection: Arc<Connection>) -> bool {
        false
    }

    /// Whether this flow still waits for a connection on `port`.
    fn requires_connection(&self, _port: u16) -> bool {
        false
    }

    /// Fail every pending and future `get` with `Interrupted`.
    fn cancel_pending(&self);

    /// Close every connection obtained so far.
    fn close_connections(&self);
}

fn close_logged(connection: &Connection) {
    if let Err(e) = connection.close() {
        log::error!("Problem closing connection {}: {e}", connection.label());
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Rendezvous between one flow instance and the service's accept loops.
pub struct ServerConnectionProvider {
    slots: HashMap<u16, Slot<Arc<Connection>>>,
}

impl ServerConnectionProvider {
    /// `ports` are all logical ports the flow uses; `entry` is the accepted
    /// connection that started the instance, bound to `entry_port`.
    pub fn new(ports: &[u16], entry_port: u16, entry: Arc<Connection>) -> Self {
        let mut slots: HashMap<u16, Slot<Arc<Connection>>> =
            ports.iter().map(|port| (*port, Slot::pending())).collect();
        slots.insert(entry_port, Slot::ready(entry));
        Self { slots }
    }

    /// Ports whose connection has not arrived yet.
    pub fn pending_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_pending())
            .map(|(port, _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

impl ConnectionProvider for ServerConnectionProvider {
    fn get(&self, port: u16) -> Result<Arc<Connection>, FlowError> {
        let slot = self.slots.get(&port).ok_or_else(|| {
            FlowError::InvalidFlow(format!("flow instance has no connection for port {port}"))
        })?;
        if slot.is_pending() {
            log::debug!("waiting for a connection on port {port}");
        }
        slot.wait()
    }

    fn assign(&self, port: u16, connection: Arc<Connection>) -> bool {
        self.slots
            .get(&port)
            .is_some_and(|slot| slot.fulfill(connection))
    }

    fn requires_connection(&self, port: u16) -> bool {
        self.slots.get(&port).is_some_and(Slot::is_pending)
    }

    fn cancel_pending(&self) {
        for slot in self.slots.values() {
            slot.cancel();
        }
    }

    fn close_connections(&self) {
        for connection in self.slots.values().filter_map(Slot::get) {
            close_logged(&connection);
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Dials each logical port the first time a step needs it.
pub struct DialingConnectionProvider {
    factory: Arc<dyn SocketFactory>,
    host: String,
    ports: HashMap<u16, u16>,
    read_buffer_size: usize,
    connections: Mutex<HashMap<u16, Arc<Connection>>>,
    cancelled: AtomicBool,
}

impl DialingConnectionProvider {
    /// `ports` maps logical ports to the remote ports to dial; unmapped
    /// logical ports are dialed as-is.
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        host: impl Into<String>,
        ports: HashMap<u16, u16>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            factory,
            host: host.into(),
            ports,
            read_buffer_size,
            connections: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    fn remote_port(&self, port: u16) -> u16 {
        self.ports.get(&port).copied().unwrap_or(port)
    }
}

impl ConnectionProvider for DialingConnectionProvider {
    fn get(&self, port: u16) -> Result<Arc<Connection>, FlowError> {
        {
            let connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(FlowError::Interrupted);
            }
            if let Some(connection) = connections.get(&port) {
                return Ok(Arc::clone(connection));
            }
        }

        // dial unlocked so close_connections and forks on other ports are
        // not held up by a slow connect
        let remote_port = self.remote_port(port);
        let transport = self.factory.connect(&self.host, remote_port)?;
        let connection = Arc::new(Connection::new(transport, self.read_buffer_size));

        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.load(Ordering::SeqCst) {
            drop(connections);
            close_logged(&connection);
            return Err(FlowError::Interrupted);
        }
        let kept = Arc::clone(
            connections
                .entry(port)
                .or_insert_with(|| Arc::clone(&connection)),
        );
        drop(connections);

        if Arc::ptr_eq(&kept, &connection) {
            log::info!("Connected to {}:{remote_port}", self.host);
        } else {
            log::debug!("port {port} was dialed concurrently, dropping the second connection");
            close_logged(&connection);
        }
        Ok(kept)
    }

    fn cancel_pending(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn close_connections(&self) {
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for connection in connections.values() {
            close_logged(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::socket::{PlainSocketFactory, Transport};

    /// Connects like [`PlainSocketFactory`] after a fixed delay.
    struct SlowFactory(Duration);

    impl SocketFactory for SlowFactory {
        fn wrap_accepted(&self, stream: std::net::TcpStream) -> io::Result<Arc<dyn Transport>> {
            PlainSocketFactory.wrap_accepted(stream)
        }

        fn connect(&self, host: &str, port: u16) -> io::Result<Arc<dyn Transport>> {
            thread::sleep(self.0);
            PlainSocketFactory.connect(host, port)
        }
    }

    fn connected_pair() -> (Arc<Connection>, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = PlainSocketFactory.connect("127.0.0.1", port).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (Arc::new(Connection::new(transport, 64)), peer)
    }

    #[test]
    fn entry_port_is_available_immediately() {
        let (entry, _peer) = connected_pair();
        let provider = ServerConnectionProvider::new(&[23, 24], 23, Arc::clone(&entry));
        assert!(Arc::ptr_eq(&provider.get(23).unwrap(), &entry));
        assert!(!provider.requires_connection(23));
        assert!(provider.requires_connection(24));
        assert!(!provider.requires_connection(25));
        assert_eq!(provider.pending_ports(), vec![24]);
    }

    #[test]
    fn get_blocks_until_assigned() {
        let (entry, _peer) = connected_pair();
        let (second, _peer2) = connected_pair();
        let provider = Arc::new(ServerConnectionProvider::new(&[1, 2], 1, entry));

        let waiter = {
            let provider = Arc::clone(&provider);
            thread::spawn(move || provider.get(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        assert!(provider.assign(2, Arc::clone(&second)));
        let got = waiter.join().unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &second));
        assert!(!provider.requires_connection(2));
        assert!(!provider.assign(2, second));
    }

    #[test]
    fn cancel_interrupts_waiting_get() {
        let (entry, _peer) = connected_pair();
        let provider = Arc::new(ServerConnectionProvider::new(&[1, 2], 1, entry));
        let waiter = {
            let provider = Arc::clone(&provider);
            thread::spawn(move || provider.get(2))
        };
        thread::sleep(Duration::from_millis(20));
        provider.cancel_pending();
        assert!(waiter.join().unwrap().unwrap_err().is_interrupted());
    }

    #[test]
    fn close_connections_closes_assigned_ones() {
        let (entry, _peer) = connected_pair();
        let provider = ServerConnectionProvider::new(&[1, 2], 1, Arc::clone(&entry));
        provider.close_connections();
        assert!(entry.is_closed());
    }

    #[test]
    fn unknown_port_is_an_error() {
        let (entry, _peer) = connected_pair();
        let provider = ServerConnectionProvider::new(&[1], 1, entry);
        assert!(matches!(provider.get(9), Err(FlowError::InvalidFlow(_))));
    }

    #[test]
    fn dialing_provider_memoises_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider = DialingConnectionProvider::new(
            Arc::new(PlainSocketFactory),
            "127.0.0.1",
            HashMap::from([(0, port)]),
            64,
        );
        let first = provider.get(0).unwrap();
        let second = provider.get(0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let (_accepted, _) = listener.accept().unwrap();

        provider.cancel_pending();
        provider.close_connections();
        assert!(first.is_closed());
        assert!(provider.get(0).unwrap_err().is_interrupted());
    }

    #[test]
    fn close_does_not_wait_for_a_slow_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider = Arc::new(DialingConnectionProvider::new(
            Arc::new(SlowFactory(Duration::from_millis(500))),
            "127.0.0.1",
            HashMap::from([(0, port)]),
            64,
        ));
        let dialing = {
            let provider = Arc::clone(&provider);
            thread::spawn(move || provider.get(0))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        provider.cancel_pending();
        provider.close_connections();
        assert!(started.elapsed() < Duration::from_millis(250));

        // the late connection is closed rather than handed out
        assert!(dialing.join().unwrap().unwrap_err().is_interrupted());
        let (mut accepted, _) = listener.accept().unwrap();
        accepted
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(io::Read::read(&mut accepted, &mut buf).unwrap(), 0);
    }

    #[test]
    fn different_ports_dial_concurrently() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider = Arc::new(DialingConnectionProvider::new(
            Arc::new(SlowFactory(Duration::from_millis(300))),
            "127.0.0.1",
            HashMap::from([(1, port), (2, port)]),
            64,
        ));

        let started = Instant::now();
        let dials: Vec<_> = [1, 2]
            .into_iter()
            .map(|logical| {
                let provider = Arc::clone(&provider);
                thread::spawn(move || provider.get(logical))
            })
            .collect();
        let connections: Vec<_> = dials
            .into_iter()
            .map(|dial| dial.join().unwrap().unwrap())
            .collect();
        assert!(started.elapsed() < Duration::from_millis(550));
        assert!(!Arc::ptr_eq(&connections[0], &connections[1]));
        provider.close_connections();
    }
}
