//! Virtual TCP server.
//!
//! ```text
//!   listener P1 ──accept──┐                       ┌──▶ worker: driver flow#1
//!   listener P2 ──accept──┼──▶ route(port, conn) ─┤
//!        ...              │     │                 └──▶ worker: driver flow#2
//!                         │     ├─ exactly one instance waits for P → assign
//!                         │     └─ otherwise → new instance (ServerConnectionProvider)
//!                         ▼
//!                  Registry { instances }  (Mutex, also consulted by stop)
//! ```
//!
//! Every logical port of the flow gets its own listener and accept thread.
//! Each new logical flow instance runs on the bounded [`WorkerPool`]; when all
//! workers are busy, accepted connections queue until one frees up.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};

use crate::cancel::CancelToken;
use crate::config::ServiceConfig;
use crate::connection::Connection;
use crate::driver::ConnectionFlowDriver;
use crate::error::FlowError;
use crate::flow::Flow;
use crate::pool::{join_before, ExitNotice, WorkerPool};
use crate::provider::{ConnectionProvider, ServerConnectionProvider};
use crate::socket::{PlainSocketFactory, SocketFactory};

/// How often an idle accept loop re-checks for shutdown.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time `Drop` grants a still-running service to wind down.
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Registry {
    stopped: bool,
    next_id: u64,
    instances: Vec<(u64, Arc<ServerConnectionProvider>)>,
}

impl Registry {
    fn release_all(&mut self) {
        for (_, provider) in self.instances.drain(..) {
            provider.cancel_pending();
            provider.close_connections();
        }
    }
}

/// A logical port and the port actually bound for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundPort {
    logical: u16,
    port: u16,
}

struct Running {
    cancel: CancelToken,
    bound: Vec<BoundPort>,
    acceptors: Vec<JoinHandle<()>>,
    acceptors_exited: Receiver<()>,
    pool: Arc<WorkerPool>,
}

pub struct VirtualTcpService {
    config: ServiceConfig,
    factory: Arc<dyn SocketFactory>,
    flow: Arc<RwLock<Option<Arc<Flow>>>>,
    registry: Arc<Mutex<Registry>>,
    running: Option<Running>,
}

impl VirtualTcpService {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_socket_factory(config, Arc::new(PlainSocketFactory))
    }

    pub fn with_socket_factory(config: ServiceConfig, factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            config,
            factory,
            flow: Arc::new(RwLock::new(None)),
            registry: Arc::new(Mutex::new(Registry::default())),
            running: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Install the flow that new connections replay.  May be called while
    /// running; instances already executing keep their flow.
    pub fn set_flow(&self, flow: Flow) -> Result<(), FlowError> {
        flow.check_buffer(self.config.read_buffer_size)?;
        if let Some(running) = &self.running {
            let listening: Vec<u16> = running.bound.iter().map(|b| b.logical).collect();
            for port in listening_ports(&flow) {
                if !listening.contains(&port) {
                    log::warn!(
                        "new flow uses logical port {port} which is not listened on until restart"
                    );
                }
            }
        }
        *self.flow.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(flow));
        Ok(())
    }

    pub fn flow(&self) -> Option<Arc<Flow>> {
        self.flow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind one listener per logical port of the flow and start accepting.
    /// Starting an already running service does nothing.
    pub fn start(&mut self) -> Result<(), FlowError> {
        if self.running.is_some() {
            return Ok(());
        }
        let flow = self.flow().ok_or(FlowError::NoFlow)?;

        let mut listeners = Vec::new();
        for logical in listening_ports(&flow) {
            let requested = self.config.bind_port(logical);
            // on failure the listeners bound so far are dropped, and closed
            let listener = self
                .factory
                .bind(requested)
                .and_then(|listener| {
                    listener.set_nonblocking(true)?;
                    Ok(listener)
                })
                .map_err(|source| FlowError::PortBind {
                    port: requested,
                    source,
                })?;
            let port = listener.local_addr()?.port();
            listeners.push((BoundPort { logical, port }, listener));
        }

        let pool = Arc::new(WorkerPool::new(
            "virtual-tcp-flow",
            self.config.max_connections,
        )?);
        let cancel = CancelToken::new();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped = false;

        let bound: Vec<BoundPort> = listeners.iter().map(|(bound, _)| *bound).collect();
        let mut acceptors = Vec::with_capacity(listeners.len());
        let (exit_tx, acceptors_exited) = unbounded();
        for (bound_port, listener) in listeners {
            let acceptor = AcceptLoop {
                listener,
                bound: bound_port,
                read_buffer_size: self.config.read_buffer_size,
                factory: Arc::clone(&self.factory),
                flow: Arc::clone(&self.flow),
                registry: Arc::clone(&self.registry),
                pool: Arc::clone(&pool),
                cancel: cancel.clone(),
            };
            let notice = ExitNotice::new(exit_tx.clone());
            let spawned = thread::Builder::new()
                .name(format!("virtual-tcp-accept-{}", bound_port.port))
                .spawn(move || {
                    let _notice = notice;
                    acceptor.run();
                });
            match spawned {
                Ok(handle) => acceptors.push(handle),
                Err(e) => {
                    cancel.cancel();
                    pool.shutdown(Duration::ZERO);
                    return Err(e.into());
                }
            }
        }

        let ports: Vec<u16> = bound.iter().map(|b| b.port).collect();
        log::info!("Waiting for connections on ports {ports:?}");
        self.running = Some(Running {
            cancel,
            bound,
            acceptors,
            acceptors_exited,
            pool,
        });
        Ok(())
    }

    /// Stop accepting, interrupt every running flow and wait up to `timeout`
    /// for the threads to finish.  Safe to call repeatedly; the service can
    /// be started again afterwards.
    pub fn stop(&mut self, timeout: Duration) {
        let Some(running) = self.running.take() else {
            return;
        };
        log::debug!("stopping virtual service");
        running.cancel.cancel();
        {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.stopped = true;
            registry.release_all();
        }

        let deadline = Instant::now() + timeout;
        if !join_before(running.acceptors, &running.acceptors_exited, deadline) {
            log::warn!(
                "accept threads didn't stop after {} millis",
                timeout.as_millis()
            );
        }
        running
            .pool
            .shutdown(deadline.saturating_duration_since(Instant::now()));
        // instances that ended between release_all and the pool draining
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release_all();
        log::info!("virtual service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound port for logical port `0`, or for the first logical port of the
    /// flow when it does not use the default one.
    pub fn port(&self) -> Option<u16> {
        let bound = &self.running.as_ref()?.bound;
        bound
            .iter()
            .find(|b| b.logical == 0)
            .or_else(|| bound.first())
            .map(|b| b.port)
    }

    /// Bound ports in the flow's logical port order.
    pub fn ports(&self) -> Vec<u16> {
        self.running
            .as_ref()
            .map(|running| running.bound.iter().map(|b| b.port).collect())
            .unwrap_or_default()
    }

    /// Bound port for a logical port of the flow.
    pub fn bound_port(&self, logical: u16) -> Option<u16> {
        self.running
            .as_ref()?
            .bound
            .iter()
            .find(|b| b.logical == logical)
            .map(|b| b.port)
    }

    /// Logical flow instances started and not yet finished.
    pub fn active_flow_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .len()
    }
}

impl Drop for VirtualTcpService {
    fn drop(&mut self) {
        self.stop(DROP_STOP_TIMEOUT);
    }
}

/// Logical ports to listen on; a flow without any port still gets the
/// default one.
fn listening_ports(flow: &Flow) -> Vec<u16> {
    let ports = flow.ports();
    if ports.is_empty() {
        vec![0]
    } else {
        ports
    }
}

struct AcceptLoop {
    listener: TcpListener,
    bound: BoundPort,
    read_buffer_size: usize,
    factory: Arc<dyn SocketFactory>,
    flow: Arc<RwLock<Option<Arc<Flow>>>>,
    registry: Arc<Mutex<Registry>>,
    pool: Arc<WorkerPool>,
    cancel: CancelToken,
}

impl AcceptLoop {
    fn run(self) {
        log::debug!(
            "accepting connections on port {} (logical {})",
            self.bound.port,
            self.bound.logical
        );
        while !self.cancel.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, _)) => self.on_accept(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.cancel.sleep(ACCEPT_POLL_INTERVAL).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!(
                        "Problem waiting for client connection on port {}. Keep waiting. {e}",
                        self.bound.port
                    );
                    if self.cancel.sleep(ACCEPT_POLL_INTERVAL).is_err() {
                        break;
                    }
                }
            }
        }
        log::debug!("stopped accepting connections on port {}", self.bound.port);
    }

    fn on_accept(&self, stream: TcpStream) {
        let transport = match self.factory.wrap_accepted(stream) {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Problem setting up accepted connection: {e}");
                return;
            }
        };
        let connection = Arc::new(Connection::new(transport, self.read_buffer_size));
        let logical = self.bound.logical;
        log::debug!(
            "accepted connection from {} on port {}",
            connection.label(),
            self.bound.port
        );

        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.stopped {
            let _ = connection.close();
            return;
        }

        let waiting: Vec<&(u64, Arc<ServerConnectionProvider>)> = registry
            .instances
            .iter()
            .filter(|(_, provider)| provider.requires_connection(logical))
            .collect();
        match waiting.as_slice() {
            [(id, provider)] => {
                if provider.assign(logical, Arc::clone(&connection)) {
                    log::debug!(
                        "[flow#{id}] routed connection from {} to waiting flow on port {logical}; still pending: {:?}",
                        connection.label(),
                        provider.pending_ports()
                    );
                    return;
                }
            }
            [] => {}
            many => log::warn!(
                "{} flows wait for a connection on port {logical}; starting a new flow for {}",
                many.len(),
                connection.label()
            ),
        }

        let Some(flow) = self
            .flow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            let _ = connection.close();
            return;
        };
        let ports = listening_ports(&flow);
        if !ports.contains(&logical) {
            log::warn!(
                "current flow does not use logical port {logical}, closing connection from {}",
                connection.label()
            );
            let _ = connection.close();
            return;
        }

        let id = registry.next_id + 1;
        registry.next_id = id;
        let provider = Arc::new(ServerConnectionProvider::new(
            &ports,
            logical,
            Arc::clone(&connection),
        ));
        registry.instances.push((id, Arc::clone(&provider)));
        drop(registry);

        let driver = ConnectionFlowDriver::new(
            format!("flow#{id} {}", connection.label()),
            flow.steps.clone(),
            Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
            self.cancel.clone(),
        );
        let registry = Arc::clone(&self.registry);
        let submitted = self.pool.execute(move || {
            driver.run();
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .instances
                .retain(|(instance, _)| *instance != id);
        });
        if !submitted {
            provider.cancel_pending();
            provider.close_connections();
            self.registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .instances
                .retain(|(instance, _)| *instance != id);
        }
    }
}
