//! Frame codec for JSON-RPC streams.
//!
//! Both channels default to `Content-Length` framing: a plain-text header
//! block terminated by a blank line, followed by exactly the declared number
//! of payload bytes. Backends that speak newline-delimited JSON can select
//! [`Framing::Ndjson`] in their profile instead, which delegates to
//! [`LinesCodec`].
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"session.idle"}
//! ```
//!
//! Use [`FrameCodec`] with [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound). Decoded items are the raw
//! UTF-8 payloads; JSON parsing happens one layer up so that a malformed
//! payload can be reported without losing frame synchronisation.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum payload size accepted by the decoder: 64 MiB.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Maximum size of a header block before its terminating blank line.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "content-length";

/// Wire framing used on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// `Content-Length` header block followed by the payload.
    #[default]
    ContentLength,
    /// One JSON document per `\n`-terminated line.
    Ndjson,
}

/// Codec for one direction (or both) of a JSON-RPC stream.
#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    /// Payload length from a header already consumed from the buffer.
    pending_len: Option<usize>,
    lines: LinesCodec,
}

impl FrameCodec {
    /// Create a codec for the given framing.
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending_len: None,
            lines: LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        }
    }

    /// Create a `Content-Length` codec.
    #[must_use]
    pub fn content_length() -> Self {
        Self::new(Framing::ContentLength)
    }

    /// Framing this codec was built with.
    #[must_use]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    fn decode_content_length(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                let Some((header_end, body_start)) = find_header_end(src) else {
                    if src.len() > MAX_HEADER_BYTES {
                        return Err(AppError::Framing(format!(
                            "header block exceeds {MAX_HEADER_BYTES} bytes"
                        )));
                    }
                    return Ok(None);
                };
                let len = parse_header_block(&src[..header_end])?;
                src.advance(body_start);
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending_len = None;
        let payload = src.split_to(len);
        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|e| AppError::Framing(format!("payload is not utf-8: {e}")))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::content_length()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.framing {
            Framing::ContentLength => self.decode_content_length(src),
            Framing::Ndjson => loop {
                // Blank keep-alive lines carry no envelope.
                match self.lines.decode(src).map_err(map_lines_error)? {
                    Some(line) if line.trim().is_empty() => continue,
                    other => return Ok(other),
                }
            },
        }
    }

    /// A stream that ends inside a frame is a fatal framing error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.framing {
            Framing::ContentLength => match self.decode_content_length(src)? {
                Some(frame) => Ok(Some(frame)),
                None if src.is_empty() && self.pending_len.is_none() => Ok(None),
                None if src.iter().all(u8::is_ascii_whitespace) && self.pending_len.is_none() => {
                    src.clear();
                    Ok(None)
                }
                None => Err(AppError::Framing(
                    "stream closed in the middle of a frame".into(),
                )),
            },
            Framing::Ndjson => {
                let line = self.lines.decode_eof(src).map_err(map_lines_error)?;
                Ok(line.filter(|l| !l.trim().is_empty()))
            }
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        match self.framing {
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", item.len());
                dst.reserve(header.len() + item.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(item.as_bytes());
                Ok(())
            }
            Framing::Ndjson => self.lines.encode(item, dst).map_err(map_lines_error),
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Locate the blank line ending the header block.
///
/// Returns `(header_len, body_start)`. Accepts `\r\n\r\n` and bare `\n\n`.
fn find_header_end(src: &[u8]) -> Option<(usize, usize)> {
    for i in 0..src.len() {
        if src[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if src[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
    }
    None
}

/// Extract the payload length from a header block.
fn parse_header_block(block: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(block)
        .map_err(|_| AppError::Framing("header block is not utf-8".into()))?;

    let mut length = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(AppError::Framing(format!("garbled header line: {line:?}")));
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                AppError::Framing(format!("invalid content-length: {:?}", value.trim()))
            })?;
            length = Some(parsed);
        }
    }

    let length = length.ok_or_else(|| AppError::Framing("missing content-length header".into()))?;
    if length > MAX_FRAME_BYTES {
        return Err(AppError::Framing(format!(
            "frame of {length} bytes exceeds {MAX_FRAME_BYTES} bytes"
        )));
    }
    Ok(length)
}

fn map_lines_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Framing(format!("line too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
