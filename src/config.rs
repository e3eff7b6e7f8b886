//! Service and client settings.

use std::collections::HashMap;

use crate::error::FlowError;
use crate::flow::Flow;

/// Receive buffer size per connection, in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;

/// Logical flow instances a service runs at the same time.
pub const DEFAULT_MAX_CONNECTION_COUNT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Port bound for logical port `0`; `0` picks an ephemeral port.
    pub port: u16,
    /// Capacity of each connection's receive buffer.
    pub read_buffer_size: usize,
    /// Upper bound on concurrently executing flow instances.
    pub max_connections: usize,
    /// Overrides for non-default logical ports (`logical -> bound`).
    pub port_map: HashMap<u16, u16>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTION_COUNT,
            port_map: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Listen for logical port `logical` on `port` instead.
    pub fn with_port_mapping(mut self, logical: u16, port: u16) -> Self {
        self.port_map.insert(logical, port);
        self
    }

    /// Port to bind for a logical port of the flow.
    pub fn bind_port(&self, logical: u16) -> u16 {
        match self.port_map.get(&logical) {
            Some(port) => *port,
            None if logical == 0 => self.port,
            None => logical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host:port` of the server to dial for logical port `0`.
    pub server_address: String,
    pub read_buffer_size: usize,
    /// Overrides for non-default logical ports (`logical -> remote`).
    pub port_map: HashMap<u16, u16>,
}

impl ClientConfig {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            port_map: HashMap::new(),
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_port_mapping(mut self, logical: u16, port: u16) -> Self {
        self.port_map.insert(logical, port);
        self
    }

    /// Split `server_address` at its last `:`.  IPv6 hosts may be given in
    /// brackets (`[::1]:80`).
    pub fn host_and_port(&self) -> Result<(String, u16), FlowError> {
        let invalid = || FlowError::InvalidAddress(self.server_address.clone());
        let (host, port) = self.server_address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        Ok((host.to_string(), port))
    }

    /// Logical-to-remote port table for `flow`.  Logical `0` dials the port
    /// of `server_address`, and so does the only port of a single-port flow
    /// (a recorded capture) unless `port_map` says otherwise.
    pub fn remote_ports(&self, flow: &Flow) -> Result<HashMap<u16, u16>, FlowError> {
        let (_, port) = self.host_and_port()?;
        let mut ports = self.port_map.clone();
        ports.entry(0).or_insert(port);
        if let [logical] = flow.ports().as_slice() {
            ports.entry(*logical).or_insert(port);
        }
        Ok(ports)
    }
}
