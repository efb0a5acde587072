//! The underlying byte pipe abstraction.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// A reliable, ordered, full-duplex byte pipe a session can run over.
///
/// Typically a TCP connection, but anything async-readable and -writable
/// works: Unix sockets, TLS streams, in-memory duplex pipes in tests.
/// Addresses are advisory; pipes without socket addresses report `None`.
pub trait Pipe: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Address of the local end, when the pipe has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Address of the remote end, when the pipe has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Pipe for tokio::net::TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }
}

#[cfg(unix)]
impl Pipe for tokio::net::UnixStream {}

impl Pipe for tokio::io::DuplexStream {}
