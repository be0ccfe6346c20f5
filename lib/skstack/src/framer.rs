//! Splits the serial byte stream into frames.
//!
//! The stream is context dependent: mostly CRLF-terminated ASCII lines, but
//! when the module is configured for binary payload delivery an `ERXUDP`
//! line announces a byte count and exactly that many raw bytes follow. Those
//! bytes may well contain `OK`, `EVENT` or CRLF sequences and must never be
//! split as lines.

use bytes::BytesMut;
use std::io::{self, Read};

const READ_CHUNK: usize = 1024;

/// How the module renders the `ERXUDP` data column. `Ascii` is the mode this
/// library actively selects (`WOPT 01`); `Binary` is the factory default on
/// some modules and must be parseable at least until the mode is switched.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PayloadMode {
    Ascii,
    Binary,
}

/// A single frame read off the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SkFrame {
    /// CRLF-terminated text line, terminator stripped.
    Line(String),
    /// Fixed-length binary run announced by the preceding `ERXUDP` line.
    Payload(Vec<u8>),
}

pub struct Framer<R> {
    reader: R,
    buf: BytesMut,
    pending_binary: usize,
    mode: PayloadMode,
}

impl<R: Read> Framer<R> {
    pub fn new(reader: R, mode: PayloadMode) -> Framer<R> {
        Framer {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            pending_binary: 0,
            mode,
        }
    }

    #[inline]
    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    #[inline]
    pub fn set_mode(&mut self, mode: PayloadMode) {
        self.mode = mode;
    }

    /// Blocks until a complete frame is available. Read timeouts propagate to
    /// the caller with partial data retained, so the next call resumes where
    /// this one left off.
    pub fn next_frame(&mut self) -> io::Result<SkFrame> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let count = self.reader.read(&mut chunk)?;

            if count == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.buf.extend_from_slice(&chunk[..count]);
        }
    }

    fn take_frame(&mut self) -> Option<SkFrame> {
        // While a binary run is pending the buffer must not be line-split.
        if self.pending_binary > 0 {
            if self.buf.len() < self.pending_binary {
                return None;
            }

            let payload = self.buf.split_to(self.pending_binary).to_vec();
            self.pending_binary = 0;

            return Some(SkFrame::Payload(payload));
        }

        let pos = find_crlf(&self.buf)?;
        let raw = self.buf.split_to(pos + 2);
        let line = String::from_utf8_lossy(&raw[..pos]).into_owned();

        if self.mode == PayloadMode::Binary {
            if let Some(count) = binary_run_length(&line) {
                self.pending_binary = count;
            }
        }

        Some(SkFrame::Line(line))
    }
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// In binary payload mode an `ERXUDP` line ends with the byte count of the
/// run that follows, as four hex digits.
fn binary_run_length(line: &str) -> Option<usize> {
    if !line.starts_with("ERXUDP") {
        return None;
    }

    line.split_whitespace()
        .last()
        .and_then(|field| usize::from_str_radix(field, 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Serial-port double that hands out scripted data in fixed-size chunks
    /// and reports a read timeout once drained.
    struct MockPort {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockPort {
        fn new(data: Vec<u8>, chunk: usize) -> MockPort {
            MockPort { data, cursor: 0, chunk }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::TimedOut.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    fn line(text: &str) -> SkFrame {
        SkFrame::Line(text.to_string())
    }

    #[test]
    fn test_splits_lines_across_chunk_boundaries() {
        let port = MockPort::new(b"OK\r\nEVENT 22 FE80:0000:0000:0000:021D:1291:0000:0001\r\n".to_vec(), 3);
        let mut framer = Framer::new(port, PayloadMode::Ascii);

        assert_eq!(framer.next_frame().unwrap(), line("OK"));
        assert_eq!(
            framer.next_frame().unwrap(),
            line("EVENT 22 FE80:0000:0000:0000:021D:1291:0000:0001")
        );
    }

    #[test]
    fn test_timeout_retains_partial_line() {
        let port = MockPort::new(b"EVE".to_vec(), 64);
        let mut framer = Framer::new(port, PayloadMode::Ascii);

        let err = framer.next_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(&framer.buf[..], b"EVE");
    }

    #[test]
    fn test_binary_run_not_line_split() {
        // The payload deliberately contains CRLF and an OK lookalike.
        let mut data = b"ERXUDP A B 0E1A 0E1A C 1 0008\r\n".to_vec();
        data.extend_from_slice(b"OK\r\n\x10\x81\x00\x01");
        data.extend_from_slice(b"OK\r\n");

        let mut framer = Framer::new(MockPort::new(data, 5), PayloadMode::Binary);

        assert_eq!(framer.next_frame().unwrap(), line("ERXUDP A B 0E1A 0E1A C 1 0008"));
        assert_eq!(
            framer.next_frame().unwrap(),
            SkFrame::Payload(b"OK\r\n\x10\x81\x00\x01".to_vec())
        );
        assert_eq!(framer.next_frame().unwrap(), line("OK"));
    }

    #[test]
    fn test_ascii_mode_erxudp_has_no_binary_run() {
        let data = b"ERXUDP A B 0E1A 0E1A C 1 0004 10810001\r\nOK\r\n".to_vec();
        let mut framer = Framer::new(MockPort::new(data, 64), PayloadMode::Ascii);

        assert_eq!(
            framer.next_frame().unwrap(),
            line("ERXUDP A B 0E1A 0E1A C 1 0004 10810001")
        );
        assert_eq!(framer.next_frame().unwrap(), line("OK"));
    }

    #[test]
    fn test_mode_switch_applies_to_subsequent_lines() {
        let mut data = b"ERXUDP A B 0E1A 0E1A C 1 0002\r\n".to_vec();
        data.extend_from_slice(b"\r\n"); // two payload bytes that happen to be CRLF
        let mut framer = Framer::new(MockPort::new(data, 64), PayloadMode::Ascii);

        // In ASCII mode the trailing CRLF parses as an empty line instead of
        // a payload run.
        assert_eq!(
            framer.next_frame().unwrap(),
            line("ERXUDP A B 0E1A 0E1A C 1 0002")
        );
        assert_eq!(framer.next_frame().unwrap(), line(""));

        framer.set_mode(PayloadMode::Binary);
        assert_eq!(framer.mode(), PayloadMode::Binary);
    }

    #[test]
    fn test_eof_surfaces_as_error() {
        struct Eof;

        impl Read for Eof {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }

        let mut framer = Framer::new(Eof, PayloadMode::Ascii);
        assert_eq!(
            framer.next_frame().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
