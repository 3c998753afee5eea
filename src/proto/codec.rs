use bytes::{Buf, BytesMut};
use std::{cmp, io, str};
use tokio_util::codec::Decoder;
use tracing::trace;

const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// Longest record accepted before the rest of the line is discarded.
pub const DEFAULT_MAX_LINE: usize = 1024;

/// Newline delimited text records from the microcontroller.
///
/// The ESP32 firmware prints with `Serial.println`, so records end with
/// `\r\n`. Bytes that are not valid UTF-8 (line noise, a reset in the
/// middle of a character) are dropped instead of failing the stream,
/// and overlong garbage is skipped up to the next newline.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode as UTF-8, silently dropping every byte sequence that is invalid.
pub fn decode_permissive(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        match str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                if let Ok(valid) = str::from_utf8(valid) {
                    out.push_str(valid);
                }
                // error_len() is None for a sequence truncated at the end
                let skip = e.error_len().unwrap_or(after.len());
                rest = &after[skip..];
            }
        }
    }
}

fn finish_line(mut raw: BytesMut) -> String {
    if raw.last() == Some(&CR) {
        raw.truncate(raw.len() - 1);
    }
    decode_permissive(&raw)
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == LF);

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    return Ok(Some(finish_line(line)));
                }
                (false, None) if src.len() > self.max_length => {
                    trace!(max = self.max_length, "Discarding overlong line");
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(match self.decode(src)? {
            Some(line) => Some(line),
            None if src.is_empty() || self.discarding => {
                src.clear();
                None
            }
            None => {
                self.next_index = 0;
                let line = src.split_to(src.len());
                Some(finish_line(line))
            }
        })
    }
}
