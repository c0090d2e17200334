//! Buffered, growable byte stream over a non-blocking socket.
//!
//! The read side is one byte vector with two cursors:
//!
//! ```text
//!  0        start              end              buf.len()
//!  |putback |  unread bytes     |  free space     |
//! ```
//!
//! Bytes in front of `start` were already consumed; the last
//! `putback_depth` of them survive compaction so [`TransportBuffer::pbackfail`]
//! can usually rewind in place. When that window is used up, pushed-back bytes
//! go to an overflow stack which is drained before anything else.
//!
//! The poller only reports *new* arrivals, so [`TransportBuffer::fill_buffer`]
//! always reads until the socket would block. Leaving bytes in the kernel
//! would mean never hearing about them again.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::Socket;
use crate::{AppError, AppResult};

/// Outcome of pulling one byte without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRead {
    Byte(u8),
    /// nothing buffered and the socket has nothing right now
    Pending,
    /// end of stream, or the socket failed
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Flushed,
    /// the socket would block; retry on a later pass
    Pending,
}

/// Sizes for a new [`TransportBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    pub initial_capacity: usize,
    pub grow_increment: usize,
    pub putback_depth: usize,
    pub non_blocking_writes: bool,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            initial_capacity: 4 * 1024,
            grow_increment: 4 * 1024,
            putback_depth: 16,
            non_blocking_writes: true,
        }
    }
}

const BLOCKING_WRITE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct TransportBuffer<S: Socket> {
    socket: S,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    putback_depth: usize,
    grow_increment: usize,
    overflow: Vec<u8>,
    out: BytesMut,
    non_blocking_writes: bool,
    eof: bool,
    failed: bool,
}

impl<S: Socket> TransportBuffer<S> {
    pub fn new(socket: S, settings: BufferSettings) -> Self {
        TransportBuffer {
            socket,
            buf: vec![0; settings.initial_capacity.max(1)],
            start: 0,
            end: 0,
            putback_depth: settings.putback_depth,
            grow_increment: settings.grow_increment.max(1),
            overflow: Vec::new(),
            out: BytesMut::with_capacity(settings.initial_capacity),
            non_blocking_writes: settings.non_blocking_writes,
            eof: false,
            failed: false,
        }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes readable without touching the socket.
    pub fn buffered(&self) -> usize {
        self.overflow.len() + (self.end - self.start)
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// A socket error was seen; nothing more will be read or written.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn set_non_blocking_writes(&mut self, on: bool) {
        self.non_blocking_writes = on;
    }

    pub fn non_blocking_writes(&self) -> bool {
        self.non_blocking_writes
    }

    fn mark_failed(&mut self, err: &io::Error) {
        if !self.failed {
            debug!("socket failed: {}", err);
        }
        self.failed = true;
    }

    /// Reads everything the socket has right now, growing the buffer as it
    /// fills. Returns the number of bytes obtained.
    ///
    /// On allocation failure the bytes read so far stay buffered and
    /// [`AppError::BufferGrowth`] is returned.
    pub fn fill_buffer(&mut self) -> AppResult<usize> {
        if self.failed || self.eof {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            if self.end == self.buf.len() {
                self.make_room()?;
            }
            match self.socket.read(&mut self.buf[self.end..]) {
                Ok(0) => {
                    trace!("peer closed its side");
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.end += n;
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_failed(&e);
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Compacts consumed bytes away (keeping the putback window), or grows
    /// the vector by one increment when compaction frees nothing.
    fn make_room(&mut self) -> AppResult<()> {
        let keep_from = self.start.saturating_sub(self.putback_depth);
        if keep_from > 0 {
            self.buf.copy_within(keep_from..self.end, 0);
            self.start -= keep_from;
            self.end -= keep_from;
            return Ok(());
        }
        let new_len = self.buf.len() + self.grow_increment;
        self.buf
            .try_reserve_exact(self.grow_increment)
            .map_err(|_| AppError::BufferGrowth(new_len))?;
        self.buf.resize(new_len, 0);
        trace!(capacity = new_len, "read buffer grown");
        Ok(())
    }

    /// Takes the next byte: pushed-back bytes first, then buffered bytes,
    /// then one drain of the socket.
    pub fn get(&mut self) -> AppResult<ByteRead> {
        if self.failed {
            return Ok(ByteRead::Closed);
        }
        if let Some(b) = self.take_buffered() {
            return Ok(ByteRead::Byte(b));
        }
        self.fill_buffer()?;
        if let Some(b) = self.take_buffered() {
            return Ok(ByteRead::Byte(b));
        }
        if self.failed || self.eof {
            Ok(ByteRead::Closed)
        } else {
            Ok(ByteRead::Pending)
        }
    }

    fn take_buffered(&mut self) -> Option<u8> {
        if let Some(b) = self.overflow.pop() {
            return Some(b);
        }
        if self.start < self.end {
            let b = self.buf[self.start];
            self.start += 1;
            return Some(b);
        }
        None
    }

    /// Pushes one byte back so the next [`get`](Self::get) returns it.
    /// Any number of consecutive pushbacks is allowed.
    pub fn pbackfail(&mut self, byte: u8) -> AppResult<()> {
        if self.overflow.is_empty() && self.start > 0 {
            self.start -= 1;
            self.buf[self.start] = byte;
            return Ok(());
        }
        self.overflow
            .try_reserve(1)
            .map_err(|_| AppError::BufferGrowth(self.overflow.len() + 1))?;
        self.overflow.push(byte);
        Ok(())
    }

    /// Probes for a dead peer without consuming anything. Buffered input
    /// keeps a half-closed connection alive until it has been read.
    pub fn connection_died(&mut self) -> bool {
        if self.failed {
            return true;
        }
        match self.socket.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                self.mark_failed(&e);
                return true;
            }
        }
        if self.buffered() > 0 {
            return false;
        }
        if self.eof {
            return true;
        }
        let mut probe = [0u8; 1];
        match self.socket.peek(&mut probe) {
            Ok(0) => {
                self.eof = true;
                true
            }
            Ok(_) => false,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => false,
            Err(e) => {
                self.mark_failed(&e);
                true
            }
        }
    }

    /// Whether the socket holds bytes not yet pulled into the buffer.
    pub fn socket_has_data(&self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.socket.peek(&mut probe), Ok(n) if n > 0)
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Writes queued output. In non-blocking-writes mode a full socket
    /// yields [`WriteStatus::Pending`]; otherwise this waits, yielding the
    /// thread, until everything is written.
    pub fn write_buffer(&mut self) -> AppResult<WriteStatus> {
        while !self.out.is_empty() {
            if self.failed {
                return Err(AppError::IoError(ErrorKind::BrokenPipe.into()));
            }
            match self.socket.write(&self.out) {
                Ok(0) => {
                    let err: io::Error = ErrorKind::WriteZero.into();
                    self.mark_failed(&err);
                    return Err(err.into());
                }
                Ok(n) => self.out.advance(n),
                Err(e)
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::NotConnected) =>
                {
                    if self.non_blocking_writes {
                        return Ok(WriteStatus::Pending);
                    }
                    std::thread::yield_now();
                    std::thread::sleep(BLOCKING_WRITE_BACKOFF);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_failed(&e);
                    return Err(e.into());
                }
            }
        }
        self.socket.flush()?;
        Ok(WriteStatus::Flushed)
    }

    /// Bytes still queued for writing. In non-blocking-writes mode one
    /// flush attempt is made first.
    pub fn output_pending(&mut self) -> usize {
        if self.non_blocking_writes && !self.out.is_empty() && !self.failed {
            if let Err(e) = self.write_buffer() {
                debug!("flush attempt failed: {}", e);
            }
        }
        self.out.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::socket::scripted::{ScriptedSocket, Step};

    fn small(socket: ScriptedSocket) -> TransportBuffer<ScriptedSocket> {
        TransportBuffer::new(
            socket,
            BufferSettings {
                initial_capacity: 4,
                grow_increment: 3,
                putback_depth: 2,
                non_blocking_writes: true,
            },
        )
    }

    fn drain(buffer: &mut TransportBuffer<ScriptedSocket>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Ok(ByteRead::Byte(b)) = buffer.get() {
            bytes.push(b);
        }
        bytes
    }

    #[test]
    fn test_fill_drains_socket_and_grows() {
        let socket = ScriptedSocket::new()
            .chunk(b"hello ")
            .chunk(b"world, this is long")
            .pause()
            .chunk(b"later");
        let mut buffer = small(socket);

        let n = buffer.fill_buffer().unwrap();
        assert_eq!(n, 25);
        assert!(buffer.capacity() >= 25);
        // growth happens in whole increments from the initial size
        assert_eq!((buffer.capacity() - 4) % 3, 0);
        assert_eq!(buffer.buffered(), 25);

        assert_eq!(drain(&mut buffer), b"hello world, this is longlater".to_vec());
    }

    #[test]
    fn test_compaction_keeps_putback_window() {
        let socket = ScriptedSocket::new().chunk(b"abc").pause().chunk(b"defg");
        let mut buffer = small(socket);
        assert_eq!(buffer.fill_buffer().unwrap(), 3);
        assert_eq!(buffer.capacity(), 4);
        for expected in b"abc" {
            assert_eq!(buffer.get().unwrap(), ByteRead::Byte(*expected));
        }

        // first the consumed prefix is compacted away, then the vector grows once
        assert_eq!(buffer.fill_buffer().unwrap(), 4);
        assert_eq!(buffer.capacity(), 7);

        // the last two consumed bytes survived compaction and rewind in place
        buffer.pbackfail(b'c').unwrap();
        buffer.pbackfail(b'b').unwrap();
        assert!(buffer.overflow.is_empty());
        assert_eq!(drain(&mut buffer), b"bcdefg".to_vec());
    }

    #[test]
    fn test_pushback_beyond_window_is_lifo() {
        let socket = ScriptedSocket::new().chunk(b"xy").pause().chunk(b"z");
        let mut buffer = small(socket);
        assert_eq!(buffer.get().unwrap(), ByteRead::Byte(b'x'));

        let pushed: Vec<u8> = (1..=10).collect();
        for b in &pushed {
            buffer.pbackfail(*b).unwrap();
        }
        let mut expected: Vec<u8> = pushed.iter().rev().copied().collect();
        expected.extend_from_slice(b"yz");
        assert_eq!(drain(&mut buffer), expected);
    }

    #[test]
    fn test_pushback_before_any_read() {
        let mut buffer = small(ScriptedSocket::new().chunk(b"q"));
        buffer.pbackfail(b'2').unwrap();
        buffer.pbackfail(b'1').unwrap();
        assert_eq!(drain(&mut buffer), b"12q".to_vec());
    }

    #[test]
    fn test_pending_then_closed() {
        let socket = ScriptedSocket::new()
            .chunk(b"a")
            .pause()
            .pause()
            .pause()
            .eof();
        let mut buffer = small(socket);
        assert_eq!(buffer.get().unwrap(), ByteRead::Byte(b'a'));
        assert_eq!(buffer.get().unwrap(), ByteRead::Pending);
        assert!(!buffer.connection_died());
        assert_eq!(buffer.get().unwrap(), ByteRead::Pending);
        assert!(buffer.connection_died());
        assert_eq!(buffer.get().unwrap(), ByteRead::Closed);
    }

    #[test]
    fn test_half_closed_peer_keeps_buffered_input() {
        let socket = ScriptedSocket::new().chunk(b"bye").eof();
        let mut buffer = small(socket);
        buffer.fill_buffer().unwrap();
        assert!(buffer.is_eof());
        assert!(!buffer.connection_died());
        assert_eq!(drain(&mut buffer), b"bye".to_vec());
        assert!(buffer.connection_died());
    }

    #[test]
    fn test_socket_error_poisons_reads() {
        let mut socket = ScriptedSocket::new().chunk(b"ab");
        socket.push(Step::Fail(ErrorKind::ConnectionReset));
        let mut buffer = small(socket);
        assert_eq!(buffer.fill_buffer().unwrap(), 2);
        assert!(buffer.is_failed());
        assert_eq!(buffer.get().unwrap(), ByteRead::Closed);
        assert!(buffer.connection_died());
    }

    #[test]
    fn test_non_blocking_write_reports_pending() {
        let mut socket = ScriptedSocket::new();
        socket.write_budget = Some(3);
        let mut buffer = small(socket);
        buffer.queue(b"hello");
        assert_eq!(buffer.write_buffer().unwrap(), WriteStatus::Pending);
        assert_eq!(buffer.output_pending(), 2);

        buffer.socket_mut().write_budget = None;
        assert_eq!(buffer.output_pending(), 0);
        assert_eq!(buffer.socket().written, b"hello".to_vec());
        assert_eq!(buffer.write_buffer().unwrap(), WriteStatus::Flushed);
    }
}
