use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;

/// The raw byte pipe under a [`TransportBuffer`](super::TransportBuffer).
///
/// Reads and writes are expected to be non-blocking: "nothing right now" is
/// reported as [`io::ErrorKind::WouldBlock`].
pub trait Socket: Read + Write {
    /// Looks at pending bytes without consuming them. `Ok(0)` means the peer
    /// has closed its side.
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Pending socket-level error, if any. Clears it.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Socket for TcpStream {
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::peek(self, buf)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}
