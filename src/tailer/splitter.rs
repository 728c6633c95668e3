// SPDX-License-Identifier: Apache-2.0

use crate::tailer::decoder::Charset;

/// One line cut from the byte stream, without its delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub bytes: Vec<u8>,
    /// Bytes this line occupied in the file, delimiter included.
    pub consumed: usize,
}

/// Reassembles raw read chunks into delimiter-terminated lines.
///
/// A trailing fragment without a delimiter is held back until a later chunk
/// completes it. Fragments that grow past `max_line_size` are cut and emitted
/// so a file that never writes a newline cannot exhaust memory. The cut is
/// moved back to a character boundary of the file's charset when possible.
#[derive(Debug)]
pub struct LineSplitter {
    charset: Charset,
    delimiter: Vec<u8>,
    max_line_size: usize,
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new(charset: Charset, max_line_size: usize) -> Self {
        Self {
            charset,
            delimiter: charset.delimiter(),
            max_line_size: max_line_size.max(1),
            pending: Vec::new(),
        }
    }

    pub fn split(&mut self, chunk: &[u8]) -> Vec<RawLine> {
        self.pending.extend_from_slice(chunk);

        let step = self.delimiter.len();
        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while start + i + step <= self.pending.len() {
            let at = start + i;
            if self.pending[at..at + step] == self.delimiter[..] {
                lines.push(RawLine {
                    bytes: self.pending[start..at].to_vec(),
                    consumed: i + step,
                });
                start = at + step;
                i = 0;
            } else if i >= self.max_line_size {
                let cut = self.charset.floor_boundary(&self.pending[start..], i);
                lines.push(RawLine {
                    bytes: self.pending[start..start + cut].to_vec(),
                    consumed: cut,
                });
                start += cut;
                i = 0;
            } else {
                i += step;
            }
        }

        self.pending.drain(..start);
        lines
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Emit the held-back fragment, if any. Used once a file can no longer grow.
    pub fn finish(&mut self) -> Option<RawLine> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        let consumed = bytes.len();
        Some(RawLine { bytes, consumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[RawLine]) -> Vec<String> {
        lines
            .iter()
            .map(|l| String::from_utf8(l.bytes.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_split_complete_lines() {
        let mut splitter = LineSplitter::new(Charset::Utf8, 1024);
        let lines = splitter.split(b"one\ntwo\n");
        assert_eq!(texts(&lines), vec!["one", "two"]);
        assert_eq!(lines[0].consumed, 4);
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn test_partial_fragment_carried_over() {
        let mut splitter = LineSplitter::new(Charset::Utf8, 1024);
        assert_eq!(texts(&splitter.split(b"hel")), Vec::<String>::new());
        assert_eq!(splitter.pending_len(), 3);

        let lines = splitter.split(b"lo\nwor");
        assert_eq!(texts(&lines), vec!["hello"]);
        assert_eq!(lines[0].consumed, 6);
        assert_eq!(splitter.pending_len(), 3);
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_output() {
        let input = b"2021-01-01 a\n\nlonger line with words\nx\ntrailing";

        let mut whole = LineSplitter::new(Charset::Utf8, 1024);
        let expected = whole.split(input);

        for chunk_size in 1..input.len() {
            let mut splitter = LineSplitter::new(Charset::Utf8, 1024);
            let mut got = Vec::new();
            for chunk in input.chunks(chunk_size) {
                got.extend(splitter.split(chunk));
            }
            assert_eq!(got, expected, "chunk size {}", chunk_size);

            let mut joined = Vec::new();
            for line in &got {
                joined.extend_from_slice(&line.bytes);
                joined.push(b'\n');
            }
            assert_eq!(&joined[..], &input[..input.len() - b"trailing".len()]);
            assert_eq!(splitter.pending_len(), b"trailing".len());
        }
    }

    #[test]
    fn test_oversized_fragment_is_force_flushed() {
        let mut splitter = LineSplitter::new(Charset::Utf8, 4);
        let lines = splitter.split(b"abcdefghij");
        assert_eq!(texts(&lines), vec!["abcd", "efgh"]);
        assert_eq!(lines[0].consumed, 4);
        assert_eq!(splitter.pending_len(), 2);

        let lines = splitter.split(b"\n");
        assert_eq!(texts(&lines), vec!["ij"]);
    }

    #[test]
    fn test_utf16_delimiter_respects_code_units() {
        // "\u{0a00}" encodes to 00 0a in LE and must not be taken for a newline
        let mut splitter = LineSplitter::new(Charset::Utf16Le, 1024);
        let lines = splitter.split(&[0x41, 0x00, 0x00, 0x0a, 0x0a, 0x00, 0x42, 0x00]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].bytes, vec![0x41, 0x00, 0x00, 0x0a]);
        assert_eq!(lines[0].consumed, 6);
        assert_eq!(splitter.pending_len(), 2);
    }

    #[test]
    fn test_finish_returns_fragment() {
        let mut splitter = LineSplitter::new(Charset::Utf8, 1024);
        splitter.split(b"done\nhalf");
        let last = splitter.finish().unwrap();
        assert_eq!(last.bytes, b"half".to_vec());
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_oversize_cut_keeps_utf8_characters_whole() {
        let mut splitter = LineSplitter::new(Charset::Utf8, 4);
        // "ab" then "中" straddles the 4 byte limit
        let lines = splitter.split("ab中cd\n".as_bytes());
        assert_eq!(texts(&lines), vec!["ab", "中c", "d"]);
        assert_eq!(lines[0].consumed, 2);
        assert_eq!(lines.iter().map(|l| l.consumed).sum::<usize>(), 8);
    }

    #[test]
    fn test_oversize_cut_keeps_gbk_characters_whole() {
        let mut splitter = LineSplitter::new(Charset::Gb, 2);
        // "x" then "中" in GBK would be cut after its lead byte
        let lines = splitter.split(&[b'x', 0xd6, 0xd0, b'\n']);
        assert_eq!(lines[0].bytes, vec![b'x']);
        assert_eq!(lines[1].bytes, vec![0xd6, 0xd0]);
    }
}
