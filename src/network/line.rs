use super::encoding::{canonicalize, BOM, REVERSED_BOM};
use super::{ByteRead, Encoding, ReadStream, Socket};
use crate::AppResult;

/// Result of trying to pull one complete line or unit.
#[derive(Debug, PartialEq, Eq)]
pub enum Extract<T> {
    Ready(T),
    /// only part of the next item has arrived
    Pending,
    /// end of stream and nothing left to deliver
    Closed,
}

/// One received line, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    text: String,
    canonical: Option<String>,
    truncated: bool,
    byte_swapped: bool,
}

impl Line {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The canonical form when canonicalization is on, the raw text otherwise.
    pub fn canonical_line(&self) -> &str {
        self.canonical.as_deref().unwrap_or(&self.text)
    }

    /// Cut at the maximum line length rather than ended by a terminator.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Wide mode: the line was decoded with swapped byte order.
    pub fn byte_swapped(&self) -> bool {
        self.byte_swapped
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

const LF: u16 = b'\n' as u16;
const CR: u16 = b'\r' as u16;

enum Unit {
    Char(u16),
    Pending,
    Closed,
}

/// Collects bytes into lines ended by `\n`, `\r` or `\r\n`.
///
/// A `\r` completes its line at once; a `\n` arriving right after it, in the
/// same chunk or a later one, is swallowed. A line is cut only when a
/// character arrives that does not fit; that character starts the next line.
#[derive(Debug)]
pub(crate) struct LineAssembler {
    encoding: Encoding,
    byte_swap: bool,
    canonicalize: bool,
    max_len: usize,
    bytes: Vec<u8>,
    units: Vec<u16>,
    /// characters in the partial line
    chars: usize,
    /// character that overflowed the previous line
    held: Option<u16>,
    after_cr: bool,
}

impl LineAssembler {
    pub(crate) fn new(
        encoding: Encoding,
        byte_swap: bool,
        canonicalize: bool,
        max_len: usize,
    ) -> Self {
        LineAssembler {
            encoding,
            byte_swap,
            canonicalize,
            max_len: max_len.max(1),
            bytes: Vec::new(),
            units: Vec::new(),
            chars: 0,
            held: None,
            after_cr: false,
        }
    }

    pub(crate) fn byte_swap(&self) -> bool {
        self.byte_swap
    }

    pub(crate) fn has_partial(&self) -> bool {
        !self.bytes.is_empty() || !self.units.is_empty() || self.held.is_some()
    }

    /// UTF-8 continuation bytes belong to the character before them.
    fn starts_char(&self, unit: u16) -> bool {
        self.encoding != Encoding::MultiByte || unit & 0xC0 != 0x80
    }

    fn next_unit<S: Socket>(&mut self, stream: &mut ReadStream<'_, S>) -> AppResult<Unit> {
        match self.encoding {
            Encoding::Wide => loop {
                let hi = match stream.get()? {
                    ByteRead::Byte(b) => b,
                    ByteRead::Pending => return Ok(Unit::Pending),
                    ByteRead::Closed => return Ok(Unit::Closed),
                };
                let lo = match stream.get()? {
                    ByteRead::Byte(b) => b,
                    ByteRead::Pending => {
                        stream.putback(hi)?;
                        return Ok(Unit::Pending);
                    }
                    // a dangling half character is dropped
                    ByteRead::Closed => return Ok(Unit::Closed),
                };
                let mut unit = u16::from_be_bytes([hi, lo]);
                if self.byte_swap {
                    unit = unit.swap_bytes();
                }
                match unit {
                    REVERSED_BOM => self.byte_swap = !self.byte_swap,
                    BOM => {}
                    _ => return Ok(Unit::Char(unit)),
                }
            },
            _ => Ok(match stream.get()? {
                ByteRead::Byte(b) => Unit::Char(u16::from(b)),
                ByteRead::Pending => Unit::Pending,
                ByteRead::Closed => Unit::Closed,
            }),
        }
    }

    fn push(&mut self, unit: u16) {
        if self.starts_char(unit) {
            self.chars += 1;
        }
        match self.encoding {
            Encoding::Wide => self.units.push(unit),
            // single-byte encodings only ever produce units below 0x100
            _ => self.bytes.push(unit as u8),
        }
    }

    fn finish(&mut self, truncated: bool) -> Line {
        self.chars = 0;
        let text = match self.encoding {
            Encoding::Wide => Encoding::decode_units(&std::mem::take(&mut self.units)),
            _ => self.encoding.decode_bytes(&std::mem::take(&mut self.bytes)),
        };
        let canonical = self.canonicalize.then(|| canonicalize(&text));
        Line {
            text,
            canonical,
            truncated,
            byte_swapped: self.byte_swap,
        }
    }

    /// Pulls bytes until a line is complete or the stream runs dry.
    pub(crate) fn poll_line<S: Socket>(
        &mut self,
        stream: &mut ReadStream<'_, S>,
    ) -> AppResult<Extract<Line>> {
        loop {
            let next = match self.held.take() {
                Some(unit) => Unit::Char(unit),
                None => self.next_unit(stream)?,
            };
            let unit = match next {
                Unit::Char(unit) => unit,
                Unit::Pending => return Ok(Extract::Pending),
                Unit::Closed => {
                    self.after_cr = false;
                    if self.has_partial() {
                        return Ok(Extract::Ready(self.finish(false)));
                    }
                    return Ok(Extract::Closed);
                }
            };
            let after_cr = std::mem::take(&mut self.after_cr);
            match unit {
                LF if after_cr => continue,
                LF => return Ok(Extract::Ready(self.finish(false))),
                CR => {
                    self.after_cr = true;
                    return Ok(Extract::Ready(self.finish(false)));
                }
                _ if self.chars >= self.max_len && self.starts_char(unit) => {
                    self.held = Some(unit);
                    return Ok(Extract::Ready(self.finish(true)));
                }
                _ => self.push(unit),
            }
        }
    }
}
