use tracing::{debug, warn};

use super::{ByteRead, Extract, ReadStream, Socket};
use crate::{AppError, AppResult};

/// Verdict of a [`UnitParser`] on the bytes gathered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCheck {
    Complete,
    Incomplete,
    Invalid,
}

/// Recognizes self-delimited protocol units. The server only frames bytes;
/// what a unit means is up to the implementation.
pub trait UnitParser {
    type Unit;

    /// Is `buf` currently one complete, syntactically valid unit?
    fn check(&self, buf: &[u8]) -> UnitCheck;

    /// Parses the unit at the front of `buf`, returning it with the number
    /// of bytes it used. Bytes past that point are handed back to the stream.
    fn parse(&self, buf: &[u8]) -> AppResult<(Self::Unit, usize)>;

    /// Best effort for an unfinished unit cut off by end of stream. `None`
    /// drops the bytes. By default the partial is offered to `parse`.
    fn close_enough(&self, buf: &[u8]) -> Option<Self::Unit> {
        self.parse(buf).ok().map(|(unit, _)| unit)
    }
}

/// Gathers bytes until the parser reports a complete unit.
#[derive(Debug, Default)]
pub(crate) struct UnitAssembler {
    partial: Vec<u8>,
}

impl UnitAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    pub(crate) fn poll_unit<P: UnitParser, S: Socket>(
        &mut self,
        parser: &P,
        stream: &mut ReadStream<'_, S>,
    ) -> AppResult<Extract<P::Unit>> {
        loop {
            let byte = match stream.get()? {
                ByteRead::Byte(b) => b,
                ByteRead::Pending => return Ok(Extract::Pending),
                ByteRead::Closed => return Ok(self.finish_at_eof(parser)),
            };
            if self.partial.is_empty() && byte.is_ascii_whitespace() {
                continue;
            }
            if self.partial.try_reserve(1).is_err() {
                stream.putback(byte)?;
                return Err(AppError::BufferGrowth(self.partial.len() + 1));
            }
            self.partial.push(byte);

            match parser.check(&self.partial) {
                UnitCheck::Incomplete => continue,
                UnitCheck::Invalid => {
                    let len = self.partial.len();
                    self.partial.clear();
                    return Err(AppError::MalformedProtocol(format!(
                        "invalid unit after {} bytes",
                        len
                    )));
                }
                UnitCheck::Complete => {
                    let (unit, used) = parser.parse(&self.partial)?;
                    let used = used.min(self.partial.len());
                    for &b in self.partial[used..].iter().rev() {
                        stream.putback(b)?;
                    }
                    self.partial.clear();
                    return Ok(Extract::Ready(unit));
                }
            }
        }
    }

    fn finish_at_eof<P: UnitParser>(&mut self, parser: &P) -> Extract<P::Unit> {
        if self.partial.is_empty() {
            return Extract::Closed;
        }
        let partial = std::mem::take(&mut self.partial);
        match parser.close_enough(&partial) {
            Some(unit) => {
                debug!(bytes = partial.len(), "accepted unterminated unit at end of stream");
                Extract::Ready(unit)
            }
            None => {
                warn!(bytes = partial.len(), "dropped incomplete unit at end of stream");
                Extract::Closed
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::socket::scripted::ScriptedSocket;
    use crate::network::{BufferSettings, TransportBuffer};

    /// Brace-balanced groups such as `{a{b}}`. A group is only known to be
    /// over once the next byte is seen, so one byte of lookahead goes back
    /// to the stream.
    pub(crate) struct BraceParser;

    fn depth_after(buf: &[u8]) -> Option<(usize, Option<usize>)> {
        if buf.first() != Some(&b'{') {
            return None;
        }
        let mut depth = 0usize;
        for (i, &b) in buf.iter().enumerate() {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some((0, Some(i + 1)));
                    }
                }
                _ => {}
            }
        }
        Some((depth, None))
    }

    impl UnitParser for BraceParser {
        type Unit = String;

        fn check(&self, buf: &[u8]) -> UnitCheck {
            match depth_after(buf) {
                None => UnitCheck::Invalid,
                Some((_, Some(end))) if buf.len() > end => UnitCheck::Complete,
                Some(_) => UnitCheck::Incomplete,
            }
        }

        fn parse(&self, buf: &[u8]) -> AppResult<(String, usize)> {
            match depth_after(buf) {
                Some((_, Some(end))) => {
                    Ok((String::from_utf8_lossy(&buf[..end]).into_owned(), end))
                }
                _ => Err(AppError::MalformedProtocol("unbalanced".to_string())),
            }
        }

        fn close_enough(&self, buf: &[u8]) -> Option<String> {
            match depth_after(buf) {
                Some((_, Some(end))) => Some(String::from_utf8_lossy(&buf[..end]).into_owned()),
                Some((depth, None)) => {
                    let mut text = String::from_utf8_lossy(buf).into_owned();
                    text.extend(std::iter::repeat('}').take(depth));
                    Some(text)
                }
                None => None,
            }
        }
    }

    /// Whitespace-separated words; a word is complete once the byte after
    /// it is seen. Relies on the default end-of-stream completion.
    struct WordParser;

    impl UnitParser for WordParser {
        type Unit = String;

        fn check(&self, buf: &[u8]) -> UnitCheck {
            match buf.last() {
                Some(b) if b.is_ascii_whitespace() => UnitCheck::Complete,
                _ => UnitCheck::Incomplete,
            }
        }

        fn parse(&self, buf: &[u8]) -> AppResult<(String, usize)> {
            let end = buf
                .iter()
                .position(u8::is_ascii_whitespace)
                .unwrap_or(buf.len());
            Ok((String::from_utf8_lossy(&buf[..end]).into_owned(), end))
        }
    }

    fn collect(socket: ScriptedSocket) -> AppResult<Vec<String>> {
        collect_with(&BraceParser, socket)
    }

    fn collect_with<P: UnitParser<Unit = String>>(
        parser: &P,
        socket: ScriptedSocket,
    ) -> AppResult<Vec<String>> {
        let mut buffer = TransportBuffer::new(socket, BufferSettings::default());
        let mut assembler = UnitAssembler::new();
        let mut units = Vec::new();
        for _ in 0..1000 {
            let mut stream = ReadStream::new(&mut buffer);
            match assembler.poll_unit(parser, &mut stream)? {
                Extract::Ready(unit) => units.push(unit),
                Extract::Pending => {}
                Extract::Closed => return Ok(units),
            }
        }
        panic!("script never ended");
    }

    #[test]
    fn test_units_across_chunks() -> AppResult<()> {
        let socket = ScriptedSocket::new()
            .chunk(b"  {a{b")
            .gap()
            .chunk(b"}}\n{c}")
            .gap()
            .chunk(b" ")
            .eof();
        assert_eq!(collect(socket)?, vec!["{a{b}}", "{c}"]);
        Ok(())
    }

    #[test]
    fn test_lookahead_byte_is_put_back() -> AppResult<()> {
        // the byte that proves `{x}` complete is the start of the next unit
        let socket = ScriptedSocket::new().chunk(b"{x}{y}{z}").eof();
        assert_eq!(collect(socket)?, vec!["{x}", "{y}", "{z}"]);
        Ok(())
    }

    #[test]
    fn test_unterminated_unit_accepted_at_eof() -> AppResult<()> {
        let socket = ScriptedSocket::new().chunk(b"{a}\n{b{c").eof();
        assert_eq!(collect(socket)?, vec!["{a}", "{b{c}}"]);
        Ok(())
    }

    #[test]
    fn test_default_completion_parses_last_unit() -> AppResult<()> {
        let socket = ScriptedSocket::new().chunk(b"one two").eof();
        assert_eq!(collect_with(&WordParser, socket)?, vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn test_invalid_unit_is_reported() {
        let socket = ScriptedSocket::new().chunk(b"oops").eof();
        assert!(matches!(collect(socket), Err(AppError::MalformedProtocol(_))));
    }
}
