//! Executes the steps of one logical flow instance.
//!
//! ```text
//!  steps: [Send P1] [Receive P1] [Parallel ─┬─ fork-1: [Send P2] ...] [Send P1]
//!                                           └─ fork-2: [Receive P1] ...
//!
//!  for each step:  cancel.check()
//!                  provider.get(port) ──▶ Connection
//!                  Send    → sleep(delay), write
//!                  Receive → await_packet
//!                  Parallel→ one scoped thread per fork, join all
//! ```
//!
//! Only the root driver releases the provider's connections when it stops;
//! forks share them with their parent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::FlowError;
use crate::flow::{FlowStep, ReceiveStep, SendStep};
use crate::provider::ConnectionProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Completed,
    Aborted,
}

pub struct ConnectionFlowDriver {
    label: String,
    steps: VecDeque<FlowStep>,
    provider: Arc<dyn ConnectionProvider>,
    cancel: CancelToken,
    port: u16,
    state: DriverState,
}

impl ConnectionFlowDriver {
    pub fn new(
        label: impl Into<String>,
        steps: Vec<FlowStep>,
        provider: Arc<dyn ConnectionProvider>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            label: label.into(),
            steps: steps.into(),
            provider,
            cancel,
            port: 0,
            state: DriverState::Running,
        }
    }

    /// Execute every step, then release the provider's connections.
    pub fn run(mut self) -> DriverState {
        log::info!("[{}] starting new flow", self.label);
        self.state = match self.execute_all() {
            Ok(()) => {
                log::info!("[{}] flow completed!", self.label);
                DriverState::Completed
            }
            Err(e) => {
                self.report(&e);
                DriverState::Aborted
            }
        };
        self.provider.cancel_pending();
        self.provider.close_connections();
        self.state
    }

    fn run_fork(mut self) -> DriverState {
        log::debug!("[{}] starting fork", self.label);
        self.state = match self.execute_all() {
            Ok(()) => {
                log::debug!("[{}] fork completed", self.label);
                DriverState::Completed
            }
            Err(e) => {
                self.report(&e);
                DriverState::Aborted
            }
        };
        self.state
    }

    fn execute_all(&mut self) -> Result<(), FlowError> {
        while let Some(step) = self.steps.pop_front() {
            self.cancel.check()?;
            self.execute(step)?;
        }
        Ok(())
    }

    fn execute(&mut self, step: FlowStep) -> Result<(), FlowError> {
        match step {
            FlowStep::Send(send) => self.send(send),
            FlowStep::Receive(receive) => self.receive(receive),
            FlowStep::Parallel(parallel) => self.fork(parallel.forks),
        }
    }

    fn send(&mut self, step: SendStep) -> Result<(), FlowError> {
        self.port = step.port;
        let connection = self.provider.get(self.port)?;
        log::debug!(
            "[{}] sending {} with {} millis delay on port {}",
            self.label,
            step.packet,
            step.delay_millis,
            self.port
        );
        if step.delay_millis > 0 {
            self.cancel.sleep(Duration::from_millis(step.delay_millis))?;
        }
        connection.write(step.packet.bytes())
    }

    fn receive(&mut self, step: ReceiveStep) -> Result<(), FlowError> {
        self.port = step.port;
        let connection = self.provider.get(self.port)?;
        log::debug!(
            "[{}] waiting for {} on port {}",
            self.label,
            step.packet,
            self.port
        );
        connection.await_packet(&step.packet)?;
        log::debug!("[{}] received expected {}", self.label, step.packet);
        Ok(())
    }

    /// Run every fork on its own thread and wait for all of them.  A fork
    /// that fails is logged and does not stop its siblings or the parent.
    fn fork(&mut self, forks: Vec<Vec<FlowStep>>) -> Result<(), FlowError> {
        let count = forks.len();
        log::debug!("[{}] starting {count} parallel forks", self.label);
        thread::scope(|scope| {
            let spawned: Vec<_> = forks
                .into_iter()
                .enumerate()
                .map(|(i, steps)| {
                    let fork = ConnectionFlowDriver {
                        label: format!("{}/fork-{}", self.label, i + 1),
                        steps: steps.into(),
                        provider: Arc::clone(&self.provider),
                        cancel: self.cancel.clone(),
                        port: self.port,
                        state: DriverState::Running,
                    };
                    thread::Builder::new()
                        .name(fork.label.clone())
                        .spawn_scoped(scope, move || fork.run_fork())
                })
                .collect();

            let mut spawn_error = None;
            let mut panicked = false;
            for handle in spawned {
                match handle {
                    Ok(handle) => panicked |= handle.join().is_err(),
                    Err(e) => spawn_error = Some(e),
                }
            }
            if panicked {
                return Err(FlowError::ForkPanicked);
            }
            if let Some(e) = spawn_error {
                return Err(FlowError::Io(e));
            }
            log::debug!("[{}] all {count} forks joined", self.label);
            Ok(())
        })
    }

    fn report(&self, error: &FlowError) {
        match error {
            FlowError::Interrupted => log::trace!("[{}] flow interrupted", self.label),
            _ if self.cancel.is_cancelled() => log::trace!(
                "[{}] received expected error while stopping: {error}",
                self.label
            ),
            FlowError::ConnectionClosed { discarded } => {
                log::info!("[{}] {error}", self.label);
                if !discarded.is_empty() {
                    log::debug!("[{}] discarding received {discarded}", self.label);
                }
            }
            _ => log::error!(
                "[{}] problem while processing flow, closing connection: {error}",
                self.label
            ),
        }
    }
}

impl std::fmt::Debug for ConnectionFlowDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFlowDriver")
            .field("label", &self.label)
            .field("remaining_steps", &self.steps.len())
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}
