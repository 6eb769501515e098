//! Splits a byte stream of concatenated JSON documents into messages.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Depth-counting JSON framer.
///
/// A frame ends when the bracket depth returns to zero outside a string.
/// Whitespace between frames is discarded. Scanning resumes where the
/// previous call stopped, so a frame split across reads is scanned once.
#[derive(Debug, Default)]
pub struct JsonFrameCodec {
    scanned: usize,
    depth: usize,
    in_str: bool,
    escaped: bool,
}

impl JsonFrameCodec {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

const fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b'\r' | b'\n' | b' ' | b'\t')
}

impl Decoder for JsonFrameCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if self.depth == 0 && !self.in_str {
            let lead = buf.iter().take_while(|b| is_whitespace(**b)).count();
            let _ = buf.split_to(lead);
            self.scanned = 0;
        }

        while self.scanned < buf.len() {
            let byte = buf[self.scanned];
            self.scanned += 1;

            if self.in_str {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_str = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_str = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.checked_sub(1).ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "unbalanced closing bracket")
                    })?;
                }
                _ => {}
            }

            if self.depth == 0 {
                let frame = buf.split_to(self.scanned);
                self.reset();
                return String::from_utf8(frame.to_vec())
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
        Ok(None)
    }
}

impl Encoder<String> for JsonFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: String, buf: &mut BytesMut) -> io::Result<()> {
        buf.extend_from_slice(msg.as_bytes());
        Ok(())
    }
}
