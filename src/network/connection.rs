use std::net::SocketAddr;

use mio::net::TcpStream;

use super::line::LineAssembler;
use super::unit::UnitAssembler;
use super::{
    BufferSettings, Encoding, Extract, Line, ReadStream, Socket, TransportBuffer, UnitParser,
    WriteStatus, WriteStream,
};
use crate::service::{Framing, ServerConfig};
use crate::{AppError, AppResult};

/// Per-connection settings, taken from the server-wide configuration when
/// a connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub buffer: BufferSettings,
    pub encoding: Encoding,
    pub byte_swap: bool,
    pub canonicalize: bool,
    pub framing: Framing,
    pub max_line_length: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        ConnectionSettings {
            buffer: BufferSettings {
                initial_capacity: config.network.read_buffer_size,
                grow_increment: config.network.grow_increment,
                putback_depth: config.network.putback_depth,
                non_blocking_writes: config.network.non_blocking_writes,
            },
            encoding: config.protocol.encoding,
            byte_swap: config.protocol.byte_swap,
            canonicalize: config.protocol.canonicalize,
            framing: config.protocol.framing,
            max_line_length: config.network.max_line_length,
        }
    }
}

/// Line mode and unit mode never mix on one connection.
#[derive(Debug)]
enum Assembly {
    Lines(LineAssembler),
    Units(UnitAssembler),
}

/// One client session: a transport buffer plus the state that turns its
/// bytes into lines or units.
#[derive(Debug)]
pub struct Connection<S: Socket = TcpStream> {
    transport: TransportBuffer<S>,
    assembly: Assembly,
    encoding: Encoding,
    peer: Option<SocketAddr>,
}

impl<S: Socket> Connection<S> {
    pub fn new(socket: S, settings: &ConnectionSettings) -> Self {
        let peer = socket.peer_addr().ok();
        let assembly = match settings.framing {
            Framing::Lines => Assembly::Lines(LineAssembler::new(
                settings.encoding,
                settings.byte_swap,
                settings.canonicalize,
                settings.max_line_length,
            )),
            Framing::Units => Assembly::Units(UnitAssembler::new()),
        };
        Connection {
            transport: TransportBuffer::new(socket, settings.buffer),
            assembly,
            encoding: settings.encoding,
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn framing(&self) -> Framing {
        match self.assembly {
            Assembly::Lines(_) => Framing::Lines,
            Assembly::Units(_) => Framing::Units,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Current byte-swap state; in wide mode BOMs on the wire may flip it.
    pub fn byte_swap(&self) -> bool {
        match &self.assembly {
            Assembly::Lines(lines) => lines.byte_swap(),
            Assembly::Units(_) => false,
        }
    }

    pub fn socket(&self) -> &S {
        self.transport.socket()
    }

    pub fn socket_mut(&mut self) -> &mut S {
        self.transport.socket_mut()
    }

    pub fn transport(&mut self) -> &mut TransportBuffer<S> {
        &mut self.transport
    }

    pub fn reader(&mut self) -> ReadStream<'_, S> {
        ReadStream::new(&mut self.transport)
    }

    pub fn writer(&mut self) -> WriteStream<'_, S> {
        let byte_swap = self.byte_swap();
        WriteStream::new(&mut self.transport, self.encoding, byte_swap)
    }

    /// Drains the socket into the read buffer.
    pub fn fill(&mut self) -> AppResult<usize> {
        self.transport.fill_buffer()
    }

    /// Bytes waiting in the buffer, not counting a partial line or unit.
    pub fn buffered_input(&self) -> usize {
        self.transport.buffered()
    }

    pub fn has_partial(&self) -> bool {
        match &self.assembly {
            Assembly::Lines(lines) => lines.has_partial(),
            Assembly::Units(units) => units.has_partial(),
        }
    }

    /// Peer closed and everything it sent has been taken.
    pub fn is_finished(&self) -> bool {
        (self.transport.is_failed() || self.transport.is_eof())
            && self.transport.buffered() == 0
    }

    pub fn connection_died(&mut self) -> bool {
        self.transport.connection_died()
    }

    pub fn output_pending(&mut self) -> usize {
        self.transport.output_pending()
    }

    pub fn flush(&mut self) -> AppResult<WriteStatus> {
        self.transport.write_buffer()
    }

    /// Next complete line, if one has fully arrived.
    pub fn next_line(&mut self) -> AppResult<Extract<Line>> {
        match &mut self.assembly {
            Assembly::Lines(lines) => {
                let mut stream = ReadStream::new(&mut self.transport);
                lines.poll_line(&mut stream)
            }
            Assembly::Units(_) => Err(AppError::IllegalStateError(
                "line requested from a unit-mode connection".to_string(),
            )),
        }
    }

    /// Next complete unit according to `parser`.
    pub fn next_unit<P: UnitParser>(&mut self, parser: &P) -> AppResult<Extract<P::Unit>> {
        match &mut self.assembly {
            Assembly::Units(units) => {
                let mut stream = ReadStream::new(&mut self.transport);
                units.poll_unit(parser, &mut stream)
            }
            Assembly::Lines(_) => Err(AppError::IllegalStateError(
                "unit requested from a line-mode connection".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::socket::scripted::ScriptedSocket;
    use crate::network::unit::tests::BraceParser;

    fn settings(framing: Framing) -> ConnectionSettings {
        ConnectionSettings {
            framing,
            ..ConnectionSettings::default()
        }
    }

    #[test]
    fn test_modes_do_not_mix() {
        let mut lines = Connection::new(ScriptedSocket::new(), &settings(Framing::Lines));
        assert!(matches!(
            lines.next_unit(&BraceParser),
            Err(AppError::IllegalStateError(_))
        ));

        let mut units = Connection::new(ScriptedSocket::new(), &settings(Framing::Units));
        assert!(matches!(units.next_line(), Err(AppError::IllegalStateError(_))));
    }

    #[test]
    fn test_finished_only_after_input_is_taken() -> AppResult<()> {
        let socket = ScriptedSocket::new().chunk(b"last words\n").eof();
        let mut conn = Connection::new(socket, &settings(Framing::Lines));
        conn.fill()?;
        assert!(!conn.is_finished());
        assert!(!conn.connection_died());
        match conn.next_line()? {
            Extract::Ready(line) => assert_eq!(line.text(), "last words"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(conn.is_finished());
        assert_eq!(conn.next_line()?, Extract::Closed);
        Ok(())
    }

    #[test]
    fn test_writer_uses_connection_encoding() -> AppResult<()> {
        let mut wide = settings(Framing::Lines);
        wide.encoding = Encoding::Wide;
        let mut conn = Connection::new(ScriptedSocket::new(), &wide);
        conn.writer().write_str("ok");
        assert_eq!(conn.flush()?, WriteStatus::Flushed);
        assert_eq!(conn.socket().written, vec![0, b'o', 0, b'k']);
        Ok(())
    }
}
