//! `virtual-tcp`: stand-in TCP servers and clients that replay scripted
//! packet flows.
//!
//! # Architecture
//!
//! ```text
//!  flow file / Wireshark JSON
//!        │ flow_file::load, capture::from_wireshark_json
//!  ┌─────▼──────┐
//!  │    Flow    │  Send / Receive / Parallel steps, one logical port each
//!  └─────┬──────┘
//!        │ set_flow
//!  ┌─────▼──────────────────┐        ┌──────────────────────┐
//!  │ VirtualTcpService      │        │ VirtualTcpClient     │
//!  │ listener + accept loop │        │ (reversed flow)      │
//!  │ per logical port       │        └──────────┬───────────┘
//!  └─────┬──────────────────┘                   │
//!        │ one ConnectionFlowDriver per logical flow instance
//!  ┌─────▼──────────────────────────────────────▼───────────┐
//!  │ ConnectionFlowDriver ── get(port) ──▶ ConnectionProvider│
//!  └─────┬───────────────────────────────────────────────────┘
//!        │
//!  ┌─────▼──────┐   ┌───────────────┐   ┌─────────────────┐
//!  │ Connection │──▶│ StreamMatcher │   │ Transport       │
//!  └────────────┘   └───────────────┘   │ (SocketFactory) │
//!                                       └─────────────────┘
//! ```
//!
//! - [`packet`]: immutable byte payloads, hex in and out
//! - [`flow`]: step model and include/port resolution
//! - [`flow_file`]: JSON flow documents
//! - [`capture`]: Wireshark JSON exports to flows
//! - [`matcher`]: finds an expected packet in a chunked byte stream
//! - [`socket`]: transport and socket factory seams
//! - [`connection`]: socket plus receive buffer
//! - [`provider`]: per-port connection lookup and rendezvous
//! - [`driver`]: step execution and parallel forks
//! - [`service`]: virtual server
//! - [`client`]: virtual client

pub mod cancel;
pub mod capture;
pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod flow;
pub mod flow_file;
pub mod matcher;
pub mod packet;
pub mod pool;
pub mod provider;
pub mod service;
pub mod slot;
pub mod socket;

pub use client::VirtualTcpClient;
pub use config::{ClientConfig, ServiceConfig};
pub use driver::{ConnectionFlowDriver, DriverState};
pub use error::FlowError;
pub use flow::{Flow, FlowStep};
pub use packet::Packet;
pub use service::VirtualTcpService;
