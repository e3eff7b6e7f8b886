use std::io;

use thiserror::Error;

use crate::packet::Packet;

/// Everything that can go wrong while loading, installing or replaying a flow.
#[derive(Error, Debug)]
pub enum FlowError {
    /// The peer closed the socket while a receive step was pending.
    /// `discarded` holds the unmatched bytes still sitting in the buffer.
    #[error("Connection closed by remote end while waiting for packet")]
    ConnectionClosed { discarded: Packet },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Cooperative cancellation: the owning service or client is stopping.
    #[error("Interrupted")]
    Interrupted,
    #[error(
        "Read buffer size of {capacity} bytes is not enough for receiving expected packet {packet}"
    )]
    BufferTooSmall { capacity: usize, packet: Packet },
    #[error("Could not bind port {port}: {source}")]
    PortBind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Invalid flow: {0}")]
    InvalidFlow(String),
    #[error("Invalid hex dump: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Invalid flow document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("A parallel fork panicked")]
    ForkPanicked,
    #[error("No flow has been set")]
    NoFlow,
}

impl FlowError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, FlowError::ConnectionClosed { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, FlowError::Interrupted)
    }
}
