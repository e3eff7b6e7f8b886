//! Virtual TCP client: replays a flow against a real server.
//!
//! The flow handed to [`VirtualTcpClient::set_flow`] is written from the
//! server's point of view (the same file a [`VirtualTcpService`] would
//! serve), so the client executes its reverse.
//!
//! [`VirtualTcpService`]: crate::service::VirtualTcpService

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::driver::{ConnectionFlowDriver, DriverState};
use crate::error::FlowError;
use crate::flow::Flow;
use crate::pool::WorkerPool;
use crate::provider::{ConnectionProvider, DialingConnectionProvider};
use crate::slot::Slot;
use crate::socket::{PlainSocketFactory, SocketFactory};

struct Running {
    cancel: CancelToken,
    provider: Arc<DialingConnectionProvider>,
    pool: WorkerPool,
    outcome: Arc<Slot<DriverState>>,
}

pub struct VirtualTcpClient {
    config: ClientConfig,
    factory: Arc<dyn SocketFactory>,
    flow: Option<Flow>,
    running: Option<Running>,
}

impl VirtualTcpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_socket_factory(config, Arc::new(PlainSocketFactory))
    }

    pub fn with_socket_factory(config: ClientConfig, factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            config,
            factory,
            flow: None,
            running: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Install a server-perspective flow; the client will execute its
    /// reverse.
    pub fn set_flow(&mut self, flow: Flow) -> Result<(), FlowError> {
        let reversed = flow.reversed();
        reversed.check_buffer(self.config.read_buffer_size)?;
        self.flow = Some(reversed);
        Ok(())
    }

    /// The flow the client executes (already reversed).
    pub fn flow(&self) -> Option<&Flow> {
        self.flow.as_ref()
    }

    fn prepare(
        &self,
    ) -> Result<(ConnectionFlowDriver, Arc<DialingConnectionProvider>, CancelToken), FlowError>
    {
        let flow = self.flow.as_ref().ok_or(FlowError::NoFlow)?;
        let (host, _) = self.config.host_and_port()?;
        let provider = Arc::new(DialingConnectionProvider::new(
            Arc::clone(&self.factory),
            host,
            self.config.remote_ports(flow)?,
            self.config.read_buffer_size,
        ));
        let cancel = CancelToken::new();
        let driver = ConnectionFlowDriver::new(
            format!("client {}", self.config.server_address),
            flow.steps.clone(),
            Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
            cancel.clone(),
        );
        Ok((driver, provider, cancel))
    }

    /// Execute the flow on the calling thread.
    pub fn run(&self) -> Result<DriverState, FlowError> {
        let (driver, _, _) = self.prepare()?;
        Ok(driver.run())
    }

    /// Execute the flow on a background worker.  Starting a client that is
    /// already running does nothing.
    pub fn start(&mut self) -> Result<(), FlowError> {
        if self.running.is_some() {
            return Ok(());
        }
        let (driver, provider, cancel) = self.prepare()?;
        let pool = WorkerPool::new("virtual-tcp-client", 1)?;
        let outcome = Arc::new(Slot::pending());
        let done = Arc::clone(&outcome);
        pool.execute(move || {
            done.fulfill(driver.run());
        });
        self.running = Some(Running {
            cancel,
            provider,
            pool,
            outcome,
        });
        Ok(())
    }

    /// Wait up to `timeout` for the started flow to finish.  `None` when it
    /// is still running or was never started.
    pub fn wait(&self, timeout: Duration) -> Option<DriverState> {
        let running = self.running.as_ref()?;
        running.outcome.wait_timeout(timeout).ok().flatten()
    }

    /// Interrupt the running flow and wait up to `timeout` for it to end.
    pub fn stop(&mut self, timeout: Duration) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        running.provider.cancel_pending();
        running.provider.close_connections();
        running.pool.shutdown(timeout);
        running.outcome.cancel();
    }
}

impl Drop for VirtualTcpClient {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowStep;

    #[test]
    fn set_flow_stores_reversed_flow() {
        let mut client = VirtualTcpClient::new(ClientConfig::new("localhost:1"));
        client
            .set_flow(Flow::new(vec![
                FlowStep::receive("Hello", 0),
                FlowStep::send("Hi", 5, 0),
            ]))
            .unwrap();
        assert_eq!(
            client.flow().unwrap().steps,
            vec![FlowStep::send("Hello", 0, 0), FlowStep::receive("Hi", 0)]
        );
    }

    #[test]
    fn set_flow_checks_buffer_of_reversed_flow() {
        let mut client =
            VirtualTcpClient::new(ClientConfig::new("localhost:1").with_read_buffer_size(2));
        // the service's long send becomes the client's receive
        let err = client
            .set_flow(Flow::new(vec![FlowStep::send("Hello", 0, 0)]))
            .unwrap_err();
        assert!(matches!(err, FlowError::BufferTooSmall { capacity: 2, .. }));
        assert!(client
            .set_flow(Flow::new(vec![FlowStep::receive("Hello", 0)]))
            .is_ok());
    }

    #[test]
    fn run_without_flow_fails() {
        let client = VirtualTcpClient::new(ClientConfig::new("localhost:1"));
        assert!(matches!(client.run(), Err(FlowError::NoFlow)));
    }

    #[test]
    fn invalid_address_is_reported() {
        let mut client = VirtualTcpClient::new(ClientConfig::new("no-port-here"));
        client.set_flow(Flow::default()).unwrap();
        assert!(matches!(client.start(), Err(FlowError::InvalidAddress(_))));
        assert_eq!(client.wait(Duration::ZERO), None);
    }
}
