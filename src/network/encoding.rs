use serde::{Deserialize, Serialize};

/// Character encoding of a line-mode connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// one byte per character, read as Latin-1
    #[default]
    EightBit,
    /// two bytes per character (UTF-16), byte order from BOMs and the swap flag
    Wide,
    /// UTF-8
    MultiByte,
}

/// Byte-order mark as read in the current byte order.
pub const BOM: u16 = 0xFEFF;
/// Byte-order mark read in the wrong byte order.
pub const REVERSED_BOM: u16 = 0xFFFE;

impl Encoding {
    /// Encodes `text` for the wire. Wide text is written big-endian, or
    /// little-endian when `byte_swap` is set.
    pub fn encode(&self, text: &str, byte_swap: bool) -> Vec<u8> {
        match self {
            Encoding::EightBit => text
                .chars()
                .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                .collect(),
            Encoding::MultiByte => text.as_bytes().to_vec(),
            Encoding::Wide => {
                let mut out = Vec::with_capacity(text.len() * 2);
                for unit in text.encode_utf16() {
                    let bytes = if byte_swap {
                        unit.to_le_bytes()
                    } else {
                        unit.to_be_bytes()
                    };
                    out.extend_from_slice(&bytes);
                }
                out
            }
        }
    }

    /// Decodes a single-byte line.
    pub(crate) fn decode_bytes(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::MultiByte => String::from_utf8_lossy(bytes).into_owned(),
            _ => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    pub(crate) fn decode_units(units: &[u16]) -> String {
        String::from_utf16_lossy(units)
    }
}

/// Whitespace normalization and case folding: runs of whitespace become one
/// space, leading and trailing whitespace is dropped, letters are lowercased.
pub fn canonicalize(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for word in line.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("  Hello \t  WORLD  "), "hello world");
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("ÀB\u{a0}c"), "àb c");
    }

    #[test]
    fn test_encode_wide_respects_swap() {
        assert_eq!(Encoding::Wide.encode("A", false), vec![0x00, 0x41]);
        assert_eq!(Encoding::Wide.encode("A", true), vec![0x41, 0x00]);
    }

    #[test]
    fn test_eight_bit_round_trip_latin1() {
        let bytes = Encoding::EightBit.encode("café", false);
        assert_eq!(bytes, vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(Encoding::EightBit.decode_bytes(&bytes), "café");
        assert_eq!(Encoding::EightBit.encode("€", false), vec![b'?']);
    }
}
