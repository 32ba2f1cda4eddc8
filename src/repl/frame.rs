//! Length-prefixed, checksummed frames carrying one envelope each.
//!
//! Layout: `[u32 len LE][u32 crc32c(body) LE][body]`. Zero-length bodies are
//! invalid; bodies above the configured cap are refused on both sides.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::{ErrorCode, ErrorPayload, Transience};

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stream ended inside a frame {section}")]
    Truncated { section: &'static str },
    #[error("zero-length frame")]
    ZeroLength,
    #[error("frame of {got} bytes exceeds max_frame_bytes {max}")]
    TooLarge { max: usize, got: usize },
    #[error("frame checksum mismatch: header {expected:#010x}, body {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
}

impl FrameError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FrameError::TooLarge { .. } => ErrorCode::FrameTooLarge,
            FrameError::Checksum { .. } | FrameError::ZeroLength => ErrorCode::Corruption,
            FrameError::Io(_) | FrameError::Truncated { .. } => ErrorCode::Unavailable,
        }
    }

    /// Transport failures may clear on reconnect; malformed frames will not.
    pub fn transience(&self) -> Transience {
        match self {
            FrameError::Io(_) | FrameError::Truncated { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    /// Error frame worth sending before closing, when the peer is still
    /// listening and can act on it.
    pub fn as_error_payload(&self) -> Option<ErrorPayload> {
        match self {
            FrameError::TooLarge { .. } | FrameError::Checksum { .. } => {
                Some(ErrorPayload::new(self.code(), self.to_string(), false))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameHeader {
    len: usize,
    crc: u32,
}

impl FrameHeader {
    fn for_body(body: &[u8], max_frame_bytes: usize) -> Result<Self, FrameError> {
        let header = Self {
            len: body.len(),
            crc: crc32c::crc32c(body),
        };
        header.check_len(max_frame_bytes)?;
        Ok(header)
    }

    fn parse(mut raw: &[u8]) -> Self {
        let len = raw.get_u32_le() as usize;
        let crc = raw.get_u32_le();
        Self { len, crc }
    }

    fn check_len(&self, max_frame_bytes: usize) -> Result<(), FrameError> {
        if self.len == 0 {
            return Err(FrameError::ZeroLength);
        }
        if self.len > max_frame_bytes || u32::try_from(self.len).is_err() {
            return Err(FrameError::TooLarge {
                max: max_frame_bytes,
                got: self.len,
            });
        }
        Ok(())
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len as u32);
        buf.put_u32_le(self.crc);
    }
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Next frame body, or `None` when the peer closed between frames.
    pub fn read_next(&mut self) -> Result<Option<Bytes>, FrameError> {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        if !self.fill(&mut raw, "header")? {
            return Ok(None);
        }
        let header = FrameHeader::parse(&raw);
        header.check_len(self.max_frame_bytes)?;

        let mut body = BytesMut::zeroed(header.len);
        if !self.fill(&mut body, "body")? {
            return Err(FrameError::Truncated { section: "body" });
        }
        let actual = crc32c::crc32c(&body);
        if actual != header.crc {
            return Err(FrameError::Checksum {
                expected: header.crc,
                actual,
            });
        }
        Ok(Some(body.freeze()))
    }

    /// Fills `buf` completely. `Ok(false)` means end of stream before the
    /// first byte; a partial fill is `Truncated`.
    fn fill(&mut self, buf: &mut [u8], section: &'static str) -> Result<bool, FrameError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(FrameError::Truncated { section }),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    /// Writes and flushes one frame; returns the bytes put on the wire.
    pub fn write_frame(&mut self, body: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(body, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

impl FrameWriter<TcpStream> {
    /// Closes both directions, unblocking any reader on a cloned handle.
    pub fn shutdown(&self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

pub fn encode_frame(body: &[u8], max_frame_bytes: usize) -> Result<Bytes, FrameError> {
    let header = FrameHeader::for_body(body, max_frame_bytes)?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    header.put(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(frames: &[u8], max: usize) -> FrameReader<Cursor<Vec<u8>>> {
        FrameReader::new(Cursor::new(frames.to_vec()), max)
    }

    #[test]
    fn reads_back_to_back_frames_then_clean_eof() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"first", 64).unwrap());
        wire.extend_from_slice(&encode_frame(b"second", 64).unwrap());

        let mut reader = reader(&wire, 64);
        assert_eq!(reader.read_next().unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(reader.read_next().unwrap().as_deref(), Some(&b"second"[..]));
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn flipped_body_byte_is_corruption() {
        let mut frame = encode_frame(b"payload", 64).unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let err = reader(&frame, 64).read_next().unwrap_err();
        assert!(matches!(err, FrameError::Checksum { .. }));
        assert_eq!(err.code(), ErrorCode::Corruption);
        assert_eq!(
            err.as_error_payload().map(|payload| payload.code),
            Some(ErrorCode::Corruption)
        );
    }

    #[test]
    fn oversize_is_refused_on_both_sides() {
        let err = encode_frame(&[0u8; 10], 5).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max: 5, got: 10 }));
        let payload = err.as_error_payload().unwrap();
        assert_eq!(payload.code, ErrorCode::FrameTooLarge);
        assert!(!payload.retryable);

        let frame = encode_frame(&[0u8; 10], 64).unwrap();
        let err = reader(&frame, 5).read_next().unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn zero_length_header_is_rejected() {
        let err = reader(&[0u8; FRAME_HEADER_LEN], 64).read_next().unwrap_err();
        assert!(matches!(err, FrameError::ZeroLength));
        assert!(encode_frame(b"", 64).is_err());
    }

    #[test]
    fn partial_frames_are_truncated_and_retryable() {
        let frame = encode_frame(b"abcdef", 64).unwrap();

        let err = reader(&frame[..frame.len() - 2], 64).read_next().unwrap_err();
        assert!(matches!(err, FrameError::Truncated { section: "body" }));
        assert!(err.transience().is_retryable());
        assert!(err.as_error_payload().is_none());

        let err = reader(&frame[..3], 64).read_next().unwrap_err();
        assert!(matches!(err, FrameError::Truncated { section: "header" }));
    }
}
