//! Checksummed LZ4 frames.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! | checksum (16) | method (1) | compressed size (4) | uncompressed size (4) | payload |
//! ```
//!
//! The compressed size counts the 9 bytes of method and sizes plus the
//! payload. The checksum is CityHash128 v1.0.2 over everything after it;
//! later CityHash releases produce different values.

use crate::error::{ChResult, ProtocolError};
use bytes::BytesMut;

pub const CHECKSUM_SIZE: usize = 16;
/// Method byte plus both sizes.
pub const HEADER_SIZE: usize = 9;
pub const FRAME_HEADER_SIZE: usize = CHECKSUM_SIZE + HEADER_SIZE;

/// Plaintext accumulated per frame on the write side.
pub const BLOCK_SIZE: usize = 1 << 20;
/// Upper bound accepted for either size field.
pub const MAX_FRAME_SIZE: usize = 1 << 30;

/// Checksum bytes as they appear in a frame header: the 128-bit hash,
/// little-endian.
pub fn checksum(s: &[u8]) -> [u8; CHECKSUM_SIZE] {
    cityhash_rs::cityhash_102_128(s).to_le_bytes()
}

/// Inputs shorter than this are stored as a single LZ4 literal run.
const MIN_LZ4_INPUT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    None = 0x02,
    Lz4 = 0x82,
    Zstd = 0x90,
}

impl Method {
    pub fn from_byte(b: u8) -> ChResult<Self> {
        match b {
            0x02 => Ok(Method::None),
            0x82 => Ok(Method::Lz4),
            0x90 => Ok(Method::Zstd),
            other => Err(ProtocolError::UnsupportedCompression(other).into()),
        }
    }
}

/// Parsed method and sizes of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub method: Method,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
}

impl FrameHeader {
    /// Parse the 9 bytes following the checksum.
    pub fn parse(header: &[u8; HEADER_SIZE]) -> ChResult<Self> {
        let method = Method::from_byte(header[0])?;
        let compressed_size =
            u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let uncompressed_size =
            u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if compressed_size < HEADER_SIZE || compressed_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::Decompress(format!(
                "compressed size {} out of range",
                compressed_size
            ))
            .into());
        }
        if uncompressed_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::Decompress(format!(
                "uncompressed size {} out of range",
                uncompressed_size
            ))
            .into());
        }

        Ok(Self {
            method,
            compressed_size,
            uncompressed_size,
        })
    }

    /// Payload bytes that follow the header.
    pub fn payload_len(&self) -> usize {
        self.compressed_size - HEADER_SIZE
    }
}

/// Append one frame holding `src` to `out`.
pub fn compress_frame(src: &[u8], out: &mut BytesMut) -> ChResult<()> {
    let start = out.len();
    let payload_start = start + FRAME_HEADER_SIZE;

    let payload_len = if src.len() < MIN_LZ4_INPUT {
        out.resize(payload_start, 0);
        write_literal_run(src, out);
        out.len() - payload_start
    } else {
        let max = lz4_flex::block::get_maximum_output_size(src.len());
        out.resize(payload_start + max, 0);
        let n = lz4_flex::block::compress_into(src, &mut out[payload_start..])
            .map_err(|e| ProtocolError::Decompress(format!("lz4 compress: {}", e)))?;
        out.truncate(payload_start + n);
        n
    };

    let compressed_size = (HEADER_SIZE + payload_len) as u32;
    let header = &mut out[start + CHECKSUM_SIZE..payload_start];
    header[0] = Method::Lz4 as u8;
    header[1..5].copy_from_slice(&compressed_size.to_le_bytes());
    header[5..9].copy_from_slice(&(src.len() as u32).to_le_bytes());

    let sum = checksum(&out[start + CHECKSUM_SIZE..]);
    out[start..start + CHECKSUM_SIZE].copy_from_slice(&sum);
    Ok(())
}

/// LZ4 sequence made only of literals: a token with the literal length,
/// an extension byte when the length is 15 or more, then the raw bytes.
fn write_literal_run(src: &[u8], out: &mut BytesMut) {
    let len = src.len();
    if len < 15 {
        out.extend_from_slice(&[(len as u8) << 4]);
    } else {
        out.extend_from_slice(&[0xF0]);
        let mut rest = len - 15;
        while rest >= 255 {
            out.extend_from_slice(&[255]);
            rest -= 255;
        }
        out.extend_from_slice(&[rest as u8]);
    }
    out.extend_from_slice(src);
}

/// Verify and decode one frame.
///
/// `body` is the method byte, both sizes and the payload, exactly as covered
/// by `expected`. The plaintext replaces the contents of `out`.
pub fn decompress_frame(
    expected: &[u8; CHECKSUM_SIZE],
    body: &[u8],
    out: &mut Vec<u8>,
) -> ChResult<()> {
    if body.len() < HEADER_SIZE {
        return Err(ProtocolError::Decompress("truncated frame header".to_string()).into());
    }
    if checksum(body) != *expected {
        return Err(ProtocolError::ChecksumMismatch.into());
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&body[..HEADER_SIZE]);
    let header = FrameHeader::parse(&header)?;
    let payload = &body[HEADER_SIZE..];
    if payload.len() != header.payload_len() {
        return Err(ProtocolError::Decompress(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len()
        ))
        .into());
    }

    out.clear();
    match header.method {
        Method::None => {
            if payload.len() != header.uncompressed_size {
                return Err(ProtocolError::Decompress(
                    "uncompressed frame size mismatch".to_string(),
                )
                .into());
            }
            out.extend_from_slice(payload);
        }
        Method::Lz4 => {
            out.resize(header.uncompressed_size, 0);
            let n = lz4_flex::block::decompress_into(payload, out)
                .map_err(|e| ProtocolError::Decompress(format!("lz4: {}", e)))?;
            if n != header.uncompressed_size {
                return Err(ProtocolError::Decompress(format!(
                    "decompressed {} bytes, expected {}",
                    n, header.uncompressed_size
                ))
                .into());
            }
        }
        Method::Zstd => {
            return Err(ProtocolError::UnsupportedCompression(Method::Zstd as u8).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChError;

    fn roundtrip(src: &[u8]) -> Vec<u8> {
        let mut frame = BytesMut::new();
        compress_frame(src, &mut frame).unwrap();

        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&frame[..CHECKSUM_SIZE]);
        let mut out = Vec::new();
        decompress_frame(&checksum, &frame[CHECKSUM_SIZE..], &mut out).unwrap();
        out
    }

    #[test]
    fn test_short_inputs_use_literal_run() {
        for len in 0..MIN_LZ4_INPUT {
            let src: Vec<u8> = (0..len as u8).collect();
            let mut frame = BytesMut::new();
            compress_frame(&src, &mut frame).unwrap();

            let extension = usize::from(len >= 15);
            assert_eq!(frame.len(), FRAME_HEADER_SIZE + 1 + extension + len);
            assert_eq!(frame[FRAME_HEADER_SIZE] >> 4, len.min(15) as u8);
            assert_eq!(roundtrip(&src), src);
        }
    }

    #[test]
    fn test_header_fields() {
        let src = vec![7u8; 4096];
        let mut frame = BytesMut::new();
        compress_frame(&src, &mut frame).unwrap();

        assert_eq!(frame[16], Method::Lz4 as u8);
        let compressed = u32::from_le_bytes([frame[17], frame[18], frame[19], frame[20]]);
        let uncompressed = u32::from_le_bytes([frame[21], frame[22], frame[23], frame[24]]);
        assert_eq!(compressed as usize, frame.len() - CHECKSUM_SIZE);
        assert_eq!(uncompressed, 4096);
        assert!(frame.len() < 200);
    }

    #[test]
    fn test_random_roundtrip() {
        use rand::Rng;
        let mut rng = rand::rng();
        for len in [0, 1, 15, 16, 17, 100, 4096, 65_537, BLOCK_SIZE, 10 << 20] {
            let mut src = vec![0u8; len];
            rng.fill(&mut src[..]);
            assert_eq!(roundtrip(&src), src, "len {}", len);
        }
    }

    #[test]
    fn test_checksum_vectors() {
        fn pattern(len: usize) -> Vec<u8> {
            (0..len).map(|i| ((i * 31 + 7) & 0xff) as u8).collect()
        }
        // (len, low, high) of CityHash128 v1.0.2.
        let vectors: &[(usize, u64, u64)] = &[
            (0, 0x3df09dfc64c09a2b, 0x3cb540c392e51e29),
            (1, 0x8be55b379cce0e40, 0x05ab4744478b1cba),
            (8, 0xf5a4ca47208136a0, 0x3dd4575b3d46e5ab),
            (16, 0x3f3a3275564b7f48, 0xb48a2a7a16bac60b),
            (33, 0x4e495b057af3b520, 0xabae1d24f18410b5),
            (128, 0xba863c0c70f32346, 0x24b156fc6f3c170a),
            (300, 0x0ad7d1f77d7e62c5, 0x0702d3372375ccf2),
            (4096, 0x1bd11ecfd108678f, 0x723d5024904233bb),
            (65_537, 0x8cc4f32cc3291c5d, 0x9c8e11d92252fa29),
        ];
        for &(len, low, high) in vectors {
            let sum = checksum(&pattern(len));
            assert_eq!(&sum[..8], &low.to_le_bytes(), "len {}", len);
            assert_eq!(&sum[8..], &high.to_le_bytes(), "len {}", len);
        }

        let sum = checksum(b"hello world");
        assert_eq!(&sum[..8], &0x7dfb52dd24b29c7bu64.to_le_bytes());
        assert_eq!(&sum[8..], &0x0f6075c357e384d0u64.to_le_bytes());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = BytesMut::new();
        compress_frame(b"some column payload bytes", &mut frame).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&frame[..CHECKSUM_SIZE]);
        let err = decompress_frame(&checksum, &frame[CHECKSUM_SIZE..], &mut Vec::new());
        assert!(matches!(
            err,
            Err(ChError::Protocol(ProtocolError::ChecksumMismatch))
        ));
    }

    #[test]
    fn test_uncompressed_method() {
        let payload = b"plain";
        let mut body = vec![Method::None as u8];
        body.extend_from_slice(&((HEADER_SIZE + payload.len()) as u32).to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(payload);
        let sum = checksum(&body);

        let mut out = Vec::new();
        decompress_frame(&sum, &body, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_unsupported_method() {
        let header = [0x90, 9, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            FrameHeader::parse(&[0x42, 9, 0, 0, 0, 0, 0, 0, 0]),
            Err(ChError::Protocol(ProtocolError::UnsupportedCompression(0x42)))
        ));

        let sum = checksum(&header);
        assert!(matches!(
            decompress_frame(&sum, &header, &mut Vec::new()),
            Err(ChError::Protocol(ProtocolError::UnsupportedCompression(0x90)))
        ));
    }
}
