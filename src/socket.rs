//! Socket factory capability.
//!
//! The engine only ever sees a [`Transport`]: an opaque, blocking byte stream
//! that can be shut down from another thread.  A [`SocketFactory`] produces
//! transports for accepted and dialed connections; plain TCP is provided by
//! [`PlainSocketFactory`], encrypted transports plug in by implementing both
//! traits.

use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;

/// A connected byte stream.  All methods take `&self` so the reading thread
/// and a closing thread can share one transport.
pub trait Transport: Send + Sync {
    /// One blocking read; `Ok(0)` means the peer closed the stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Close both directions, unblocking any pending `read`.
    fn shutdown(&self) -> io::Result<()>;

    fn local_port(&self) -> io::Result<u16>;

    /// Human-readable remote endpoint, used to tag log lines.
    fn peer_label(&self) -> String;
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream: &TcpStream = self;
        io::Read::read(&mut stream, buf)
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut stream: &TcpStream = self;
        io::Write::write_all(&mut stream, data)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.local_addr()?.port())
    }

    fn peer_label(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown-peer".to_string())
    }
}

/// Produces listening sockets and transports for the orchestrators.
pub trait SocketFactory: Send + Sync {
    /// Bind a listener on every interface; port `0` picks an ephemeral port.
    fn bind(&self, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", port))
    }

    /// Turn a freshly accepted stream into a transport (e.g. run a server
    /// handshake).
    fn wrap_accepted(&self, stream: TcpStream) -> io::Result<Arc<dyn Transport>>;

    fn connect(&self, host: &str, port: u16) -> io::Result<Arc<dyn Transport>>;
}

/// Unencrypted TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSocketFactory;

impl SocketFactory for PlainSocketFactory {
    fn wrap_accepted(&self, stream: TcpStream) -> io::Result<Arc<dyn Transport>> {
        // Listeners are polled in non-blocking mode; some platforms hand
        // that flag down to accepted sockets.
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(stream))
    }

    fn connect(&self, host: &str, port: u16) -> io::Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(stream))
    }
}
