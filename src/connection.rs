//! One socket plus the receive buffer its steps match against.
//!
//! A [`Connection`] is shared (`Arc`) between the driver executing steps on
//! it and the provider/orchestrator that may close it during shutdown.  The
//! matcher state sits behind a mutex but is only ever used by the single
//! driver or fork currently executing steps on this connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::FlowError;
use crate::matcher::StreamMatcher;
use crate::packet::Packet;
use crate::socket::Transport;

pub struct Connection {
    transport: Arc<dyn Transport>,
    matcher: Mutex<StreamMatcher>,
    closed: AtomicBool,
    local_port: u16,
    label: String,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, read_buffer_size: usize) -> Self {
        let local_port = transport.local_port().unwrap_or(0);
        let label = transport.peer_label();
        Self {
            transport,
            matcher: Mutex::new(StreamMatcher::new(read_buffer_size)),
            closed: AtomicBool::new(false),
            local_port,
            label,
        }
    }

    /// Direct blocking write, no buffering.
    pub fn write(&self, data: &[u8]) -> Result<(), FlowError> {
        self.transport.write_all(data)?;
        Ok(())
    }

    /// Block until `packet` arrives, skipping anything received before it.
    /// Returns the number of bytes consumed from the stream.
    pub fn await_packet(&self, packet: &Packet) -> Result<usize, FlowError> {
        let transport = &self.transport;
        let mut matcher = self.matcher.lock().unwrap_or_else(PoisonError::into_inner);
        matcher.await_match(&self.label, packet.bytes(), |free| {
            log::trace!("[{}] reading from socket", self.label);
            transport.read(free)
        })
    }

    /// Idempotent; may be called from any thread to unblock a pending read.
    pub fn close(&self) -> Result<(), FlowError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.shutdown()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Local port the socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote endpoint, for log lines.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.label)
            .field("local_port", &self.local_port)
            .field("closed", &self.is_closed())
            .finish()
    }
}
