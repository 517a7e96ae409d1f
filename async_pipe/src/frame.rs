//! Length-prefixed message framing used on both ends of a pipe.
//!
//! A message is a big-endian `i32` length followed by the payload. Payloads longer than
//! `i32::MAX` bytes use a `-1` marker followed by a big-endian `u64` length.

use std::io;

use crate::error::{Error, Result};

const SHORT_HEADER: usize = 4;
const LONG_HEADER: usize = SHORT_HEADER + 8;
const LONG_MARKER: i32 = -1;

/// Encodes the header for a payload of `len` bytes.
pub(crate) fn encode_header(len: usize) -> ([u8; LONG_HEADER], usize) {
    let mut header = [0u8; LONG_HEADER];
    match i32::try_from(len) {
        Ok(short) => {
            header[..SHORT_HEADER].copy_from_slice(&short.to_be_bytes());
            (header, SHORT_HEADER)
        }
        Err(_) => {
            header[..SHORT_HEADER].copy_from_slice(&LONG_MARKER.to_be_bytes());
            header[SHORT_HEADER..].copy_from_slice(&(len as u64).to_be_bytes());
            (header, LONG_HEADER)
        }
    }
}

/// Appends a complete frame (header and payload) to `out`.
pub(crate) fn encode_into(payload: &[u8], out: &mut Vec<u8>) {
    let (header, header_len) = encode_header(payload.len());
    out.reserve(header_len + payload.len());
    out.extend_from_slice(&header[..header_len]);
    out.extend_from_slice(payload);
}

/// Validates `offset`/`size` against `buf` and returns the selected window.
pub(crate) fn window(buf: &[u8], offset: usize, size: Option<usize>) -> Result<&[u8]> {
    if offset > buf.len() {
        return Err(Error::InvalidArgument("offset is out of bounds"));
    }
    let end = match size {
        None => buf.len(),
        Some(size) => match offset.checked_add(size) {
            Some(end) if end <= buf.len() => end,
            _ => return Err(Error::InvalidArgument("buffer length < offset + size")),
        },
    };
    Ok(&buf[offset..end])
}

/// Accumulates received bytes and splits them into frames.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
    start: usize,
}

impl FrameDecoder {
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// True if no bytes of a partial or complete frame are buffered.
    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.buf.len()
    }

    /// True if a whole frame is buffered.
    pub(crate) fn has_frame(&self) -> Result<bool> {
        Ok(self.frame_bounds()?.is_some())
    }

    /// Removes and returns the next complete frame, if one is buffered.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some((header_len, len)) = self.frame_bounds()? else {
            return Ok(None);
        };
        let begin = self.start + header_len;
        let payload = self.buf[begin..begin + len].to_vec();
        self.start = begin + len;
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
        Ok(Some(payload))
    }

    /// Header length and payload length of the first frame, once it is fully buffered.
    fn frame_bounds(&self) -> Result<Option<(usize, usize)>> {
        let pending = &self.buf[self.start..];
        if pending.len() < SHORT_HEADER {
            return Ok(None);
        }
        let mut short = [0u8; SHORT_HEADER];
        short.copy_from_slice(&pending[..SHORT_HEADER]);
        let (header_len, len) = match i32::from_be_bytes(short) {
            LONG_MARKER => {
                if pending.len() < LONG_HEADER {
                    return Ok(None);
                }
                let mut long = [0u8; 8];
                long.copy_from_slice(&pending[SHORT_HEADER..LONG_HEADER]);
                let len = usize::try_from(u64::from_be_bytes(long)).map_err(|_| {
                    Error::BrokenChannel(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "message length does not fit in memory",
                    ))
                })?;
                (LONG_HEADER, len)
            }
            len if len < 0 => {
                return Err(Error::BrokenChannel(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "negative message length",
                )));
            }
            len => (SHORT_HEADER, len as usize),
        };
        if pending.len() - header_len < len {
            return Ok(None);
        }
        Ok(Some((header_len, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_is_four_bytes() {
        let (header, len) = encode_header(3);
        assert_eq!(len, 4);
        assert_eq!(&header[..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn long_header_uses_marker() {
        let (header, len) = encode_header(0x8000_0000);
        assert_eq!(len, 12);
        assert_eq!(&header[..4], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&header[4..], &[0, 0, 0, 0, 0x80, 0, 0, 0]);
    }

    #[test]
    fn decoder_waits_for_whole_frame() {
        let mut wire = Vec::new();
        encode_into(b"hello", &mut wire);

        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire[..2]);
        assert!(!decoder.has_frame().unwrap());
        decoder.extend(&wire[2..6]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert!(!decoder.is_empty());
        decoder.extend(&wire[6..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"hello");
        assert!(decoder.is_empty());
    }

    #[test]
    fn decoder_splits_back_to_back_frames() {
        let mut wire = Vec::new();
        encode_into(b"one", &mut wire);
        encode_into(b"", &mut wire);
        encode_into(b"three", &mut wire);

        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"one");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"three");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn negative_length_is_broken_channel() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&(-7i32).to_be_bytes());
        assert!(matches!(decoder.next_frame(), Err(Error::BrokenChannel(_))));
    }

    #[test]
    fn window_checks_bounds() {
        let buf = [1u8, 2, 3, 4];
        assert_eq!(window(&buf, 1, Some(2)).unwrap(), &[2, 3]);
        assert_eq!(window(&buf, 4, None).unwrap(), &[] as &[u8]);
        assert!(matches!(window(&buf, 5, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(window(&buf, 2, Some(3)), Err(Error::InvalidArgument(_))));
        assert!(matches!(window(&buf, 1, Some(usize::MAX)), Err(Error::InvalidArgument(_))));
    }
}
