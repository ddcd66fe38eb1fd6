//! Netstring framing.
//!
//! A payload `D` travels as `len(D)` in decimal ASCII, `:`, `D`, `,`. The
//! format is self-delimiting and cheap to parse byte-by-byte, which matters
//! because the SSH channel underneath can return arbitrarily short reads.
//!
//! [`compose`] and [`parse`] operate on complete frames and exist mostly for
//! tests and one-shot tools; [`NetstringCodec`] is the streaming form used on
//! the backend channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size accepted by default: 32 KiB.
pub const DEFAULT_FRAME_LIMIT: usize = 32 * 1024;

/// Framing failures.
///
/// `Eof` is its own variant because the read loop treats it differently from
/// a malformed frame: EOF means the peer went away, everything else means the
/// stream is corrupt.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("non-digit character found in length part")]
    NonDigitLength,

    #[error("message length was not specified")]
    EmptyLength,

    #[error("unable to find length delimiter")]
    MissingDelimiter,

    #[error("length part is bigger than the limit ({0} bytes)")]
    OverLimit(usize),

    #[error("length specified does not match message length")]
    LengthMismatch,

    #[error("message terminator is missing")]
    MissingTerminator,

    #[error("channel closed or EOF")]
    Eof,

    #[error("i/o error while framing: {0}")]
    Io(#[from] std::io::Error),
}

/// Compose a single netstring frame for `data`.
pub fn compose(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.put_slice(data.len().to_string().as_bytes());
    out.put_u8(b':');
    out.put_slice(data);
    out.put_u8(b',');
    out.freeze()
}

/// Parse exactly one complete netstring frame, returning its payload.
pub fn parse(input: &[u8]) -> Result<&[u8], FramingError> {
    let delim = input
        .iter()
        .position(|&b| b == b':')
        .ok_or(FramingError::MissingDelimiter)?;
    if delim == 0 {
        return Err(FramingError::EmptyLength);
    }
    let length = parse_length(&input[..delim])?;

    if input.len() < delim + 2 || *input.last().expect("non-empty input") != b',' {
        return Err(FramingError::MissingTerminator);
    }
    let data = &input[delim + 1..input.len() - 1];
    if data.len() != length {
        return Err(FramingError::LengthMismatch);
    }
    Ok(data)
}

fn parse_length(digits: &[u8]) -> Result<usize, FramingError> {
    let mut length: usize = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(FramingError::NonDigitLength);
        }
        length = length
            .checked_mul(10)
            .and_then(|l| l.checked_add(usize::from(b - b'0')))
            .ok_or(FramingError::NonDigitLength)?;
    }
    Ok(length)
}

/// Streaming netstring codec with a configurable payload size cap.
#[derive(Debug, Clone)]
pub struct NetstringCodec {
    limit: usize,
}

impl NetstringCodec {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_LIMIT)
    }
}

impl Decoder for NetstringCodec {
    type Item = BytesMut;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        // Scan the length prefix. The cap is enforced while the prefix is
        // still accumulating so an attacker cannot make us buffer an
        // arbitrarily long run of digits.
        let mut length: usize = 0;
        let mut colon = None;
        for (i, &b) in src.iter().enumerate() {
            if b == b':' {
                if i == 0 {
                    return Err(FramingError::EmptyLength);
                }
                colon = Some(i);
                break;
            }
            if !b.is_ascii_digit() {
                return Err(FramingError::NonDigitLength);
            }
            length = length * 10 + usize::from(b - b'0');
            if length > self.limit {
                return Err(FramingError::OverLimit(self.limit));
            }
        }
        let Some(colon) = colon else {
            return Ok(None);
        };

        let frame_end = colon + 1 + length + 1;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }
        if src[frame_end - 1] != b',' {
            return Err(FramingError::MissingTerminator);
        }

        src.advance(colon + 1);
        let data = src.split_to(length);
        src.advance(1);
        Ok(Some(data))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // EOF in the middle of a frame.
            None => Err(FramingError::Eof),
        }
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FramingError> {
        if item.len() > self.limit {
            return Err(FramingError::OverLimit(self.limit));
        }
        dst.reserve(item.len() + 16);
        dst.put_slice(item.len().to_string().as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}
