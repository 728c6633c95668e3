// SPDX-License-Identifier: Apache-2.0

//! Conversion of raw line bytes from the source character set into UTF-8.

use encoding_rs::{Encoding, GB18030, GBK, UTF_8, UTF_16BE, UTF_16LE};
use tracing::debug;

use crate::tailer::error::{Error, Result};

/// Byte layout of an encoding, as far as line splitting needs to know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Utf16Le,
    Utf16Be,
    /// GBK and GB18030: ASCII plus two and four byte sequences.
    Gb,
}

impl Charset {
    /// The newline character as it appears on disk.
    pub fn delimiter(self) -> Vec<u8> {
        match self {
            Charset::Utf16Le => vec![b'\n', 0x00],
            Charset::Utf16Be => vec![0x00, b'\n'],
            Charset::Utf8 | Charset::Gb => vec![b'\n'],
        }
    }

    pub fn is_utf16(self) -> bool {
        matches!(self, Charset::Utf16Le | Charset::Utf16Be)
    }

    /// Largest offset `<= at` in `bytes` that does not split a character,
    /// backing off no more than one character's width. `at` itself is
    /// returned when no boundary is found that close.
    pub fn floor_boundary(self, bytes: &[u8], at: usize) -> usize {
        let at = at.min(bytes.len());
        let found = match self {
            Charset::Utf8 => (at.saturating_sub(3)..=at)
                .rev()
                .find(|&i| i == bytes.len() || (bytes[i] & 0xc0) != 0x80),
            Charset::Utf16Le | Charset::Utf16Be => {
                if at < 2 {
                    None
                } else {
                    let pair = [bytes[at - 2], bytes[at - 1]];
                    let unit = if self == Charset::Utf16Le {
                        u16::from_le_bytes(pair)
                    } else {
                        u16::from_be_bytes(pair)
                    };
                    // never leave a high surrogate at the end
                    Some(if (0xd800..0xdc00).contains(&unit) { at - 2 } else { at })
                }
            }
            Charset::Gb => {
                let mut i = 0;
                let mut last = 0;
                while i < at {
                    last = i;
                    i += gb_char_len(&bytes[i..]);
                }
                Some(if i == at { at } else { last })
            }
        };
        match found {
            Some(0) | None => at,
            Some(i) => i,
        }
    }
}

fn gb_char_len(bytes: &[u8]) -> usize {
    match bytes {
        [0x81..=0xfe, 0x30..=0x39, ..] => 4,
        [0x81..=0xfe, ..] => 2,
        _ => 1,
    }
}

/// Decodes lines read from a file in a fixed character encoding.
///
/// `none` (or an empty name) skips charset conversion entirely; invalid
/// UTF-8 is still replaced so downstream stages always see valid text.
#[derive(Debug, Clone)]
pub struct Decoder {
    encoding: Option<&'static Encoding>,
}

impl Decoder {
    pub fn new(name: &str) -> Result<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        let encoding = match normalized.as_str() {
            "" | "none" => None,
            "utf-8" | "utf8" => Some(UTF_8),
            "utf-16le" => Some(UTF_16LE),
            "utf-16be" => Some(UTF_16BE),
            "gbk" => Some(GBK),
            "gb18030" => Some(GB18030),
            _ => {
                return Err(Error::Encoding(format!(
                    "unknown character encoding {:?}",
                    name
                )));
            }
        };

        Ok(Self { encoding })
    }

    /// Decode one line. Malformed sequences become U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self.encoding {
            None => String::from_utf8_lossy(bytes).into_owned(),
            Some(encoding) => {
                let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
                if had_errors {
                    debug!(
                        encoding = encoding.name(),
                        len = bytes.len(),
                        "Replaced malformed sequences while decoding line"
                    );
                }
                text.into_owned()
            }
        }
    }

    pub fn charset(&self) -> Charset {
        match self.encoding {
            Some(e) if e == UTF_16LE => Charset::Utf16Le,
            Some(e) if e == UTF_16BE => Charset::Utf16Be,
            Some(e) if e == GBK || e == GB18030 => Charset::Gb,
            _ => Charset::Utf8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_names() {
        for name in ["utf-8", "UTF-8", "utf-16le", "utf-16be", "gbk", "gb18030", "none", ""] {
            assert!(Decoder::new(name).is_ok(), "{} should be accepted", name);
        }
    }

    #[test]
    fn test_unknown_encoding_is_config_error() {
        let err = Decoder::new("latin-9000").unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(err.to_string().contains("unknown character encoding"));
    }

    #[test]
    fn test_decode_utf16le() {
        let decoder = Decoder::new("utf-16le").unwrap();
        let bytes: Vec<u8> = "héllo"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(decoder.decode(&bytes), "héllo");
        assert_eq!(decoder.charset().delimiter(), vec![0x0a, 0x00]);
    }

    #[test]
    fn test_decode_utf16be_delimiter() {
        let decoder = Decoder::new("utf-16be").unwrap();
        assert_eq!(decoder.charset().delimiter(), vec![0x00, 0x0a]);
    }

    #[test]
    fn test_decode_gbk() {
        let decoder = Decoder::new("gbk").unwrap();
        // "中文" in GBK
        assert_eq!(decoder.decode(&[0xd6, 0xd0, 0xce, 0xc4]), "中文");
        assert_eq!(decoder.charset(), Charset::Gb);
        assert_eq!(decoder.charset().delimiter(), vec![b'\n']);
    }

    #[test]
    fn test_none_replaces_invalid_utf8() {
        let decoder = Decoder::new("none").unwrap();
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{fffd}ok");
    }

    #[test]
    fn test_utf8_boundary_backs_off_continuation_bytes() {
        // "a" then "中" (3 bytes) then "b"
        let bytes = "a中b".as_bytes();
        assert_eq!(Charset::Utf8.floor_boundary(bytes, 1), 1);
        assert_eq!(Charset::Utf8.floor_boundary(bytes, 2), 1);
        assert_eq!(Charset::Utf8.floor_boundary(bytes, 3), 1);
        assert_eq!(Charset::Utf8.floor_boundary(bytes, 4), 4);
        // nothing but continuation bytes in reach
        assert_eq!(Charset::Utf8.floor_boundary(&[0x80; 8], 6), 6);
    }

    #[test]
    fn test_gb_boundary_follows_lead_bytes() {
        // "x" then "中文" in GBK
        let bytes = [b'x', 0xd6, 0xd0, 0xce, 0xc4];
        assert_eq!(Charset::Gb.floor_boundary(&bytes, 2), 1);
        assert_eq!(Charset::Gb.floor_boundary(&bytes, 3), 3);
        assert_eq!(Charset::Gb.floor_boundary(&bytes, 4), 3);
        // GB18030 four byte sequence; the only earlier boundary is the start
        let bytes = [0x81, 0x30, 0x81, 0x30, b'y'];
        assert_eq!(Charset::Gb.floor_boundary(&bytes, 3), 3);
        assert_eq!(Charset::Gb.floor_boundary(&bytes, 4), 4);
    }

    #[test]
    fn test_utf16_boundary_keeps_surrogate_pairs() {
        let bytes: Vec<u8> = "a😀"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(Charset::Utf16Le.floor_boundary(&bytes, 4), 2);
        assert_eq!(Charset::Utf16Le.floor_boundary(&bytes, 2), 2);
        assert_eq!(Charset::Utf16Le.floor_boundary(&bytes, 6), 6);
    }
}
