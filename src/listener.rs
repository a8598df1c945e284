//! TCP transport: bind and accept.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Outcome of one [`Listener::accept`] call.
pub(crate) enum Accepted {
    Connection(TcpStream, SocketAddr),
    /// The process ran out of descriptors or memory. Accepting again right
    /// away would fail the same way.
    Exhausted(io::Error),
}

pub(crate) struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub(crate) async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self { inner: TcpListener::bind(addr).await? })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Waits for the next connection. Transient errors (a peer that reset
    /// before being accepted, an interrupted call) are logged and skipped.
    pub(crate) async fn accept(&self) -> Accepted {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, "set_nodelay failed: {e}");
                    }
                    return Accepted::Connection(stream, peer);
                }
                Err(e) if is_exhaustion(&e) => return Accepted::Exhausted(e),
                Err(e) => warn!("accept error: {e}"),
            }
        }
    }
}

fn is_exhaustion(e: &io::Error) -> bool {
    // EMFILE, ENFILE
    matches!(e.raw_os_error(), Some(23 | 24)) || e.kind() == io::ErrorKind::OutOfMemory
}
