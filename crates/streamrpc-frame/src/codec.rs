use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::message::{JsonRpcMessage, ParseMessage};

/// Default byte budget for a single message: 1 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Concatenated-JSON codec for JSON-RPC messages.
///
/// Wire format: top-level JSON objects written back to back, with no length
/// prefix and no delimiter.
///
/// ```text
/// {"jsonrpc":"2.0","method":"echo","params":1,"id":null}{"jsonrpc":"2.0",...
/// ```
///
/// The decoder finds object boundaries by counting braces and brackets while
/// tracking whether it is inside a string literal, so structural characters
/// in string values are ignored. Whitespace between objects is skipped.
/// Scan state survives across calls, so input may arrive in chunks of any
/// size, including single bytes.
///
/// The encoder writes each item with `serde_json` and no separator.
#[derive(Debug)]
pub struct JsonRpcCodec<T = JsonRpcMessage> {
    max_message_bytes: usize,
    scanner: Scanner,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonRpcCodec<T> {
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            scanner: Scanner::default(),
            _marker: PhantomData,
        }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }
}

impl<T> Default for JsonRpcCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonRpcCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_message_bytes(self.max_message_bytes)
    }
}

/// Incremental string-aware scanner for one top-level JSON object.
#[derive(Debug, Default)]
struct Scanner {
    /// Bytes of the current object already inspected.
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scanner {
    /// Resume scanning `buf`, which starts at the object's opening brace.
    /// Returns the object's length once its closing brace is seen.
    fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        while self.offset < buf.len() {
            let byte = buf[self.offset];
            self.offset += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.offset);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn started(&self) -> bool {
        self.offset > 0
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn is_json_whitespace(byte: &u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

impl<T: ParseMessage> Decoder for JsonRpcCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        if !self.scanner.started() {
            let skip = src.iter().take_while(|b| is_json_whitespace(b)).count();
            src.advance(skip);
            match src.first() {
                None => return Ok(None),
                Some(b'{') => {}
                Some(other) => {
                    return Err(FrameError::Parse(format!(
                        "expected '{{' at message boundary, found byte 0x{other:02x}"
                    )))
                }
            }
        }

        let Some(len) = self.scanner.scan(src) else {
            if src.len() > self.max_message_bytes {
                return Err(FrameError::MessageLength {
                    size: src.len(),
                    max: self.max_message_bytes,
                });
            }
            return Ok(None);
        };

        self.scanner.reset();
        if len > self.max_message_bytes {
            return Err(FrameError::MessageLength {
                size: len,
                max: self.max_message_bytes,
            });
        }
        let object = src.split_to(len);
        let value: serde_json::Value = serde_json::from_slice(&object)?;
        T::parse(value).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.iter().all(is_json_whitespace) {
            src.clear();
            return Ok(None);
        }
        Err(FrameError::Parse(format!(
            "stream ended inside a JSON value ({} bytes pending)",
            src.len()
        )))
    }
}

impl<T: Serialize> Encoder<T> for JsonRpcCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        serde_json::to_writer(dst.writer(), &item)?;
        Ok(())
    }
}
