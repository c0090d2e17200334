use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use tracing::{debug, info, warn};

use super::poll::{PollHandle, LISTENER};
use super::{ByteRead, Encoding, Socket, TransportBuffer, WriteStatus};
use crate::{AppError, AppResult};

/// Read side of a [`TransportBuffer`].
pub struct ReadStream<'a, S: Socket> {
    buffer: &'a mut TransportBuffer<S>,
}

impl<'a, S: Socket> ReadStream<'a, S> {
    pub fn new(buffer: &'a mut TransportBuffer<S>) -> Self {
        ReadStream { buffer }
    }

    pub fn get(&mut self) -> AppResult<ByteRead> {
        self.buffer.get()
    }

    pub fn putback(&mut self, byte: u8) -> AppResult<()> {
        self.buffer.pbackfail(byte)
    }

    /// Bytes that can be read without blocking. Pulls from the socket once
    /// when nothing is buffered but the socket has data waiting.
    pub fn input_available(&mut self) -> AppResult<usize> {
        if self.buffer.buffered() == 0 && self.buffer.socket_has_data() {
            self.buffer.fill_buffer()?;
        }
        Ok(self.buffer.buffered())
    }

    pub fn connection_died(&mut self) -> bool {
        self.buffer.connection_died()
    }
}

/// Write side of a [`TransportBuffer`], with the connection's encoding for
/// text output.
pub struct WriteStream<'a, S: Socket> {
    buffer: &'a mut TransportBuffer<S>,
    encoding: Encoding,
    byte_swap: bool,
}

impl<'a, S: Socket> WriteStream<'a, S> {
    pub fn new(buffer: &'a mut TransportBuffer<S>, encoding: Encoding, byte_swap: bool) -> Self {
        WriteStream {
            buffer,
            encoding,
            byte_swap,
        }
    }

    /// Queues raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.queue(bytes);
    }

    /// Queues text in the connection's encoding.
    pub fn write_str(&mut self, text: &str) {
        let bytes = self.encoding.encode(text, self.byte_swap);
        self.buffer.queue(&bytes);
    }

    pub fn flush_output(&mut self) -> AppResult<WriteStatus> {
        self.buffer.write_buffer()
    }

    pub fn output_pending(&mut self) -> usize {
        self.buffer.output_pending()
    }

    pub fn connection_died(&mut self) -> bool {
        self.buffer.connection_died()
    }

    pub fn set_non_blocking_writes(&mut self, on: bool) {
        self.buffer.set_non_blocking_writes(on);
    }
}

impl<S: Socket> io::Write for WriteStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.queue(buf);
        Ok(buf.len())
    }

    /// A flush that would block leaves the rest queued for the server loop.
    fn flush(&mut self) -> io::Result<()> {
        match self.buffer.write_buffer() {
            Ok(_) => Ok(()),
            Err(AppError::IoError(e)) => Err(e),
            Err(e) => Err(io::Error::new(ErrorKind::Other, e.to_string())),
        }
    }
}

/// Listening socket. Accepted sockets become new transport buffers.
#[derive(Debug)]
pub struct ListenStream {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ListenStream {
    pub fn bind(addr: SocketAddr, poll: &PollHandle) -> AppResult<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.register(&mut listener, LISTENER, Interest::READABLE)?;
        info!(%local_addr, "listening for connections");
        Ok(ListenStream {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts a waiting connection, waiting up to `timeout` for one to
    /// arrive. Readiness seen for other sockets during the wait stays
    /// recorded in `poll`.
    pub fn await_connection(
        &mut self,
        poll: &mut PollHandle,
        timeout: Duration,
    ) -> AppResult<Option<(TcpStream, SocketAddr)>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(accepted) = self.try_accept()? {
                return Ok(Some(accepted));
            }
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|remaining| remaining.is_zero()) {
                return Ok(None);
            }
            poll.wait(remaining)?;
            if !poll.take_listener_ready() {
                // woken for something else; let the loop see it
                return Ok(None);
            }
        }
    }

    fn try_accept(&mut self) -> AppResult<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "set_nodelay failed: {}", e);
                    }
                    return Ok(Some((stream, peer)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(local_addr = %self.local_addr, "transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(AppError::Accept(e.to_string())),
            }
        }
    }

    pub fn close(mut self, poll: &PollHandle) {
        if let Err(e) = poll.deregister(&mut self.listener) {
            debug!("deregister listener failed: {}", e);
        }
        info!(local_addr = %self.local_addr, "closed listener");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;

    use super::*;
    use crate::network::socket::scripted::ScriptedSocket;
    use crate::network::BufferSettings;

    #[test]
    fn test_input_available_pulls_once() -> AppResult<()> {
        let socket = ScriptedSocket::new().chunk(b"abc").pause().chunk(b"de");
        let mut buffer = TransportBuffer::new(socket, BufferSettings::default());
        let mut reader = ReadStream::new(&mut buffer);
        assert_eq!(reader.input_available()?, 3);
        assert_eq!(reader.get()?, ByteRead::Byte(b'a'));
        // still buffered, the socket is not touched
        assert_eq!(reader.input_available()?, 2);
        assert!(!reader.connection_died());
        Ok(())
    }

    #[test]
    fn test_write_stream_queues_until_flushed() -> AppResult<()> {
        let mut socket = ScriptedSocket::new();
        socket.write_budget = Some(2);
        let mut buffer = TransportBuffer::new(socket, BufferSettings::default());
        let mut writer = WriteStream::new(&mut buffer, Encoding::EightBit, false);
        writer.write_str("hi!");
        writer.write_all(b"\n")?;
        assert_eq!(writer.flush_output()?, WriteStatus::Pending);
        assert_eq!(writer.output_pending(), 2);
        buffer.socket_mut().write_budget = None;
        assert_eq!(buffer.write_buffer()?, WriteStatus::Flushed);
        assert_eq!(buffer.socket().written, b"hi!\n");
        Ok(())
    }

    #[test]
    fn test_await_connection_times_out_then_accepts() -> AppResult<()> {
        let mut poll = PollHandle::new(16)?;
        let mut listener = ListenStream::bind("127.0.0.1:0".parse().unwrap(), &poll)?;
        assert!(listener
            .await_connection(&mut poll, Duration::from_millis(20))?
            .is_none());

        let client = StdTcpStream::connect(listener.local_addr())?;
        let (_stream, peer) = listener
            .await_connection(&mut poll, Duration::from_secs(2))?
            .expect("pending connection");
        assert_eq!(peer, client.local_addr()?);
        listener.close(&poll);
        Ok(())
    }
}
