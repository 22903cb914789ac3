//! Frame codec, write side.
//!
//! Encodes into an in-memory buffer, so individual writes cannot fail.
//! The connection flushes the buffer to the socket and reports I/O errors
//! there, once per request.

use super::compress::{self, BLOCK_SIZE};
use super::{days_from_date, secs_from_datetime, swap_uuid};
use crate::error::{ChError, ChResult, ProtocolError};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Initial buffer capacity
const BUFFER_CAPACITY: usize = 64 * 1024;

pub struct ChWriter {
    buf: BytesMut,
    /// Plaintext waiting to be framed while compression is on.
    block: Vec<u8>,
    compressing: bool,
    /// First framing failure inside a compression scope.
    frame_err: Option<ChError>,
}

impl Default for ChWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(BUFFER_CAPACITY),
            block: Vec::new(),
            compressing: false,
            frame_err: None,
        }
    }

    /// Encoded bytes not yet flushed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything written so far, including a half-built frame.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.block.clear();
        self.compressing = false;
        self.frame_err = None;
    }

    /// Take the encoded bytes, leaving the writer empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// Run `f` with every write routed through compressed frames when
    /// `enabled`. The last partial frame is emitted before returning.
    pub fn with_compression<F>(&mut self, enabled: bool, f: F) -> ChResult<()>
    where
        F: FnOnce(&mut Self) -> ChResult<()>,
    {
        if !enabled {
            return f(self);
        }

        self.compressing = true;
        let res = f(self);
        self.compressing = false;
        let flushed = self.flush_block();
        match self.frame_err.take() {
            Some(err) => Err(err),
            None => res.and(flushed),
        }
    }

    fn flush_block(&mut self) -> ChResult<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let res = compress::compress_frame(&self.block, &mut self.buf);
        self.block.clear();
        res
    }

    /// Raw bytes, no length prefix.
    pub fn put_raw(&mut self, mut bytes: &[u8]) {
        if !self.compressing {
            self.buf.extend_from_slice(bytes);
            return;
        }

        while !bytes.is_empty() {
            if self.block.capacity() == 0 {
                self.block.reserve(BLOCK_SIZE);
            }
            let room = BLOCK_SIZE - self.block.len();
            let n = room.min(bytes.len());
            self.block.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if self.block.len() == BLOCK_SIZE
                && let Err(err) = self.flush_block()
            {
                self.frame_err.get_or_insert(err);
            }
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put_raw(&[v]);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Unsigned LEB128.
    pub fn put_uvarint(&mut self, mut v: u64) {
        let mut tmp = [0u8; 10];
        let mut i = 0;
        while v >= 0x80 {
            tmp[i] = (v as u8) | 0x80;
            v >>= 7;
            i += 1;
        }
        tmp[i] = v as u8;
        self.put_raw(&tmp[..=i]);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.put_u8(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.put_raw(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.put_raw(&v.to_le_bytes());
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_uvarint(v.len() as u64);
        self.put_raw(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_uuid(&mut self, v: &Uuid) {
        let mut bytes = *v.as_bytes();
        swap_uuid(&mut bytes);
        self.put_raw(&bytes);
    }

    /// UUID given as raw bytes in canonical order.
    pub fn put_uuid_bytes(&mut self, v: &[u8]) -> ChResult<()> {
        let mut bytes: [u8; 16] = v
            .try_into()
            .map_err(|_| ProtocolError::InvalidUuidLength(v.len()))?;
        swap_uuid(&mut bytes);
        self.put_raw(&bytes);
        Ok(())
    }

    pub fn put_date(&mut self, v: NaiveDate) {
        self.put_u16(days_from_date(v));
    }

    pub fn put_datetime(&mut self, v: &DateTime<Utc>) {
        self.put_u32(secs_from_datetime(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compress::{CHECKSUM_SIZE, FRAME_HEADER_SIZE};

    #[test]
    fn test_uvarint_encoding() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
            (
                u64::MAX,
                &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01],
            ),
        ];
        for (value, expected) in cases {
            let mut wr = ChWriter::new();
            wr.put_uvarint(*value);
            assert_eq!(wr.as_bytes(), *expected, "value {}", value);
        }
    }

    #[test]
    fn test_fixed_width_little_endian() {
        let mut wr = ChWriter::new();
        wr.put_u16(0x0102);
        wr.put_i32(-1);
        wr.put_u64(0x0102030405060708);
        assert_eq!(
            wr.as_bytes(),
            &[
                0x02, 0x01, 0xff, 0xff, 0xff, 0xff, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02,
                0x01
            ]
        );
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut wr = ChWriter::new();
        wr.put_str("hello");
        wr.put_str("");
        assert_eq!(wr.as_bytes(), b"\x05hello\x00");
    }

    #[test]
    fn test_uuid_bytes_length_check() {
        let mut wr = ChWriter::new();
        assert!(wr.put_uuid_bytes(&[0u8; 15]).is_err());
        assert!(wr.is_empty());
        wr.put_uuid_bytes(&[1u8; 16]).unwrap();
        assert_eq!(wr.len(), 16);
    }

    #[test]
    fn test_compression_emits_frames() {
        let mut wr = ChWriter::new();
        wr.put_u8(0xAA);
        wr.with_compression(true, |wr| {
            wr.put_raw(&vec![1u8; BLOCK_SIZE + 10]);
            Ok(())
        })
        .unwrap();
        wr.put_u8(0xBB);

        let bytes = wr.take();
        assert_eq!(bytes[0], 0xAA);
        assert_eq!(*bytes.last().unwrap(), 0xBB);

        // Two frames: one full block and the 10-byte tail.
        let first = &bytes[1..];
        let size = u32::from_le_bytes(first[17..21].try_into().unwrap()) as usize;
        let second = &first[CHECKSUM_SIZE + size..];
        let tail = u32::from_le_bytes(second[21..25].try_into().unwrap()) as usize;
        assert_eq!(tail, 10);
        assert_eq!(second.len(), FRAME_HEADER_SIZE + 1 + 10 + 1);
        assert!(wr.is_empty());
    }

    #[test]
    fn test_disabled_compression_is_passthrough() {
        let mut wr = ChWriter::new();
        wr.with_compression(false, |wr| {
            wr.put_str("abc");
            Ok(())
        })
        .unwrap();
        assert_eq!(wr.as_bytes(), b"\x03abc");
    }
}
