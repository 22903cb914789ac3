//! Frame codec, read side.
//!
//! Wraps the socket in a buffered reader and, while a compressed section is
//! open, serves reads from decompressed frames instead.

use super::compress::{self, CHECKSUM_SIZE, FrameHeader, HEADER_SIZE};
use super::{date_from_days, datetime_from_secs, swap_uuid};
use crate::error::{ChError, ChResult, ProtocolError};
use chrono::{DateTime, NaiveDate, Utc};
use std::io;
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader};
use uuid::Uuid;

const BUFFER_CAPACITY: usize = 64 * 1024;
const MAX_VARINT_LEN: usize = 10;
/// Strings longer than this are treated as a corrupt stream.
const MAX_STRING_LEN: u64 = 1 << 30;

pub struct ChReader<R> {
    inner: BufReader<R>,
    compressed: bool,
    /// Method, sizes and payload of the current frame.
    frame: Vec<u8>,
    /// Decompressed bytes of the current frame.
    data: Vec<u8>,
    pos: usize,
}

fn invalid_data(msg: &str) -> ChError {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string()).into()
}

impl<R: AsyncRead + Unpin> ChReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(BUFFER_CAPACITY, inner),
            compressed: false,
            frame: Vec::new(),
            data: Vec::new(),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    /// The underlying stream, e.g. for writing. Reading through it directly
    /// would bypass buffered bytes.
    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }

    /// Bytes received but not yet consumed, in either layer.
    pub fn buffered(&self) -> usize {
        self.inner.buffer().len() + (self.data.len() - self.pos)
    }

    /// Start serving reads from compressed frames.
    pub fn begin_compressed(&mut self) {
        self.compressed = true;
        self.pos = 0;
        self.data.clear();
    }

    /// Leave the compressed section. Frames never straddle packets, so any
    /// decompressed byte left over means the stream is out of sync.
    pub fn end_compressed(&mut self) -> ChResult<()> {
        self.compressed = false;
        let unread = self.data.len() - self.pos;
        self.data.clear();
        self.pos = 0;
        if unread > 0 {
            return Err(ProtocolError::UnreadData(unread).into());
        }
        Ok(())
    }

    /// True when nothing is waiting on the socket and it is still open.
    ///
    /// Never blocks: a pending read means the peer is silent, which is the
    /// only healthy state for an idle connection.
    pub async fn is_idle(&mut self) -> bool {
        if self.buffered() > 0 {
            return false;
        }
        let inner = &mut self.inner;
        std::future::poll_fn(|cx| match Pin::new(&mut *inner).poll_fill_buf(cx) {
            Poll::Pending => Poll::Ready(true),
            // Data, EOF or a socket error.
            Poll::Ready(_) => Poll::Ready(false),
        })
        .await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> ChResult<()> {
        if !self.compressed {
            self.inner.read_exact(buf).await?;
            return Ok(());
        }

        let mut filled = 0;
        while filled < buf.len() {
            if self.pos == self.data.len() {
                self.next_frame().await?;
                continue;
            }
            let n = (buf.len() - filled).min(self.data.len() - self.pos);
            buf[filled..filled + n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> ChResult<()> {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        self.inner.read_exact(&mut checksum).await?;

        let mut header = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut header).await?;
        let parsed = FrameHeader::parse(&header)?;

        self.frame.clear();
        self.frame.extend_from_slice(&header);
        self.frame.resize(HEADER_SIZE + parsed.payload_len(), 0);
        self.inner.read_exact(&mut self.frame[HEADER_SIZE..]).await?;

        compress::decompress_frame(&checksum, &self.frame, &mut self.data)?;
        self.pos = 0;
        Ok(())
    }

    pub async fn read_u8(&mut self) -> ChResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_bool(&mut self) -> ChResult<bool> {
        Ok(self.read_u8().await? != 0)
    }

    /// Unsigned LEB128.
    pub async fn read_uvarint(&mut self) -> ChResult<u64> {
        let mut x: u64 = 0;
        let mut shift = 0;
        for i in 0..MAX_VARINT_LEN {
            let b = self.read_u8().await?;
            if b < 0x80 {
                if i == MAX_VARINT_LEN - 1 && b > 1 {
                    break;
                }
                return Ok(x | (b as u64) << shift);
            }
            x |= ((b & 0x7f) as u64) << shift;
            shift += 7;
        }
        Err(invalid_data("varint overflows a 64-bit integer"))
    }

    pub async fn read_i8(&mut self) -> ChResult<i8> {
        Ok(self.read_u8().await? as i8)
    }

    pub async fn read_u16(&mut self) -> ChResult<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    pub async fn read_i16(&mut self) -> ChResult<i16> {
        Ok(self.read_u16().await? as i16)
    }

    pub async fn read_u32(&mut self) -> ChResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }

    pub async fn read_i32(&mut self) -> ChResult<i32> {
        Ok(self.read_u32().await? as i32)
    }

    pub async fn read_u64(&mut self) -> ChResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await?;
        Ok(u64::from_le_bytes(buf))
    }

    pub async fn read_i64(&mut self) -> ChResult<i64> {
        Ok(self.read_u64().await? as i64)
    }

    pub async fn read_f32(&mut self) -> ChResult<f32> {
        Ok(f32::from_bits(self.read_u32().await?))
    }

    pub async fn read_f64(&mut self) -> ChResult<f64> {
        Ok(f64::from_bits(self.read_u64().await?))
    }

    /// Length-prefixed byte string.
    pub async fn read_bytes(&mut self) -> ChResult<Vec<u8>> {
        let len = self.read_uvarint().await?;
        if len > MAX_STRING_LEN {
            return Err(invalid_data("string length out of range"));
        }
        // Grow with the data so a bogus length costs no more than the bytes sent.
        let len = len as usize;
        let mut buf = Vec::with_capacity(len.min(BUFFER_CAPACITY));
        while buf.len() < len {
            let start = buf.len();
            buf.resize(start + (len - start).min(BUFFER_CAPACITY), 0);
            self.read_exact(&mut buf[start..]).await?;
        }
        Ok(buf)
    }

    /// Length-prefixed string; invalid UTF-8 is replaced, not rejected.
    pub async fn read_string(&mut self) -> ChResult<String> {
        let bytes = self.read_bytes().await?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    pub async fn read_uuid(&mut self) -> ChResult<Uuid> {
        let mut bytes = [0u8; 16];
        self.read_exact(&mut bytes).await?;
        swap_uuid(&mut bytes);
        Ok(Uuid::from_bytes(bytes))
    }

    /// Read a UUID into `out` in canonical byte order.
    pub async fn read_uuid_into(&mut self, out: &mut [u8]) -> ChResult<()> {
        if out.len() != 16 {
            return Err(ProtocolError::InvalidUuidLength(out.len()).into());
        }
        let uuid = self.read_uuid().await?;
        out.copy_from_slice(uuid.as_bytes());
        Ok(())
    }

    pub async fn read_date(&mut self) -> ChResult<NaiveDate> {
        Ok(date_from_days(self.read_u16().await?))
    }

    pub async fn read_datetime(&mut self) -> ChResult<DateTime<Utc>> {
        Ok(datetime_from_secs(self.read_u32().await?))
    }
}
