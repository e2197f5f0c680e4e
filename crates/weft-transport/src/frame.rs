//! Binary framing: the 12-byte little-endian frame header, its CRCs and
//! the read/write paths every message passes through.
//!
//! Layout on the wire:
//!
//! ```text
//! u32 frame_length           total bytes including this header
//! u8  security_provider_mask 0=none 1=ssl 2=kerberos 3=negotiate 4=claims
//! u8  frame_header_crc       crc8 over the header with crc fields zeroed
//! u16 headers_length         bytes of the headers portion of the body
//! u32 frame_body_crc         crc32 over headers+body, or 0
//! ```
//!
//! Both CRC algorithms are compatibility-critical: CRC-8 with
//! polynomial 0x07 and zero init, CRC-32 IEEE.

use bytes::BytesMut;
use crc::{CRC_8_SMBUS, CRC_32_ISO_HDLC, Crc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Size of the serialized frame header.
pub const FRAME_HEADER_LEN: usize = 12;

/// Default cap on a single frame, guarding against corrupt length
/// prefixes driving unbounded allocations.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// CRC-8 poly 0x07 / init 0, and the IEEE (Ethernet) CRC-32.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Which security provider protects the channel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SecurityProvider {
    /// Cleartext frames, integrity by the frame CRCs.
    #[default]
    None = 0,
    /// TLS records tunnelled through the frame layer.
    Ssl = 1,
    /// Windows Kerberos authentication.
    Kerberos = 2,
    /// Windows negotiate authentication.
    Negotiate = 3,
    /// Claims-based authentication.
    Claims = 4,
}

/// The parsed 12-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including this header.
    pub frame_length: u32,
    /// Security provider mask byte.
    pub security_provider_mask: u8,
    /// CRC-8 over the zero-crc header, or 0.
    pub frame_header_crc: u8,
    /// Length of the headers portion of the body.
    pub headers_length: u16,
    /// CRC-32 over the body, or 0.
    pub frame_body_crc: u32,
}

impl FrameHeader {
    fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..4].copy_from_slice(&self.frame_length.to_le_bytes());
        out[4] = self.security_provider_mask;
        out[5] = self.frame_header_crc;
        out[6..8].copy_from_slice(&self.headers_length.to_le_bytes());
        out[8..12].copy_from_slice(&self.frame_body_crc.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: [u8; FRAME_HEADER_LEN]) -> FrameHeader {
        FrameHeader {
            frame_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            security_provider_mask: bytes[4],
            frame_header_crc: bytes[5],
            headers_length: u16::from_le_bytes([bytes[6], bytes[7]]),
            frame_body_crc: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }

    fn header_crc(self) -> u8 {
        let zeroed =
            FrameHeader { frame_header_crc: 0, frame_body_crc: 0, ..self };
        CRC8.checksum(&zeroed.to_bytes())
    }
}

/// Validation toggles for the read path.
#[derive(Debug, Clone, Copy)]
pub struct FrameReadConfig {
    /// Verify the CRC-8 over the frame header.
    pub check_header_crc: bool,
    /// Verify the CRC-32 over the frame body.
    pub check_body_crc: bool,
    /// Reject frames longer than this.
    pub max_frame_size: u32,
}

impl Default for FrameReadConfig {
    fn default() -> Self {
        FrameReadConfig {
            check_header_crc: true,
            check_body_crc: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Generation toggles for the write path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameWriteConfig {
    /// Provider mask stamped on every frame.
    pub security_provider: SecurityProvider,
    /// Generate the CRC-8 over the frame header.
    pub header_crc: bool,
    /// Generate the CRC-32 over the frame body.
    pub body_crc: bool,
}

/// Reads the next frame, returning its header and body bytes.
pub async fn read_frame<R>(
    reader: &mut R,
    config: &FrameReadConfig,
) -> Result<(FrameHeader, BytesMut), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    let header = FrameHeader::from_bytes(raw);

    decode_frame_header(header, config)?;

    let body_len = header.frame_length as usize - FRAME_HEADER_LEN;
    let mut body = BytesMut::zeroed(body_len);
    reader.read_exact(&mut body).await?;

    check_body(header, &body, config)?;

    Ok((header, body))
}

/// Validates a frame header against the read config (CRC and bounds).
pub(crate) fn decode_frame_header(
    header: FrameHeader,
    config: &FrameReadConfig,
) -> Result<(), TransportError> {
    if (header.frame_length as usize) < FRAME_HEADER_LEN {
        return Err(TransportError::Format(format!(
            "frame length {} shorter than the frame header",
            header.frame_length
        )));
    }
    if header.frame_length > config.max_frame_size {
        return Err(TransportError::Format(format!(
            "frame length {} exceeds maximum {}",
            header.frame_length, config.max_frame_size
        )));
    }
    if usize::from(header.headers_length) > header.frame_length as usize - FRAME_HEADER_LEN {
        return Err(TransportError::Format(format!(
            "headers length {} exceeds frame body",
            header.headers_length
        )));
    }
    if config.check_header_crc && header.frame_header_crc != header.header_crc() {
        return Err(TransportError::Format("frame header crc8 check failed".into()));
    }
    Ok(())
}

pub(crate) fn check_body(
    header: FrameHeader,
    body: &[u8],
    config: &FrameReadConfig,
) -> Result<(), TransportError> {
    if config.check_body_crc && header.frame_body_crc != CRC32.checksum(body) {
        return Err(TransportError::Format("frame body crc32 check failed".into()));
    }
    Ok(())
}

/// Builds the full wire image of one frame around an already-marshaled
/// message (`headers_len` header bytes followed by the body).
pub fn encode_frame(headers_len: usize, msg: &[u8], config: &FrameWriteConfig) -> Vec<u8> {
    let mut header = FrameHeader {
        frame_length: (FRAME_HEADER_LEN + msg.len()) as u32,
        security_provider_mask: config.security_provider as u8,
        frame_header_crc: 0,
        headers_length: headers_len as u16,
        frame_body_crc: 0,
    };

    if config.header_crc {
        header.frame_header_crc = header.header_crc();
    }
    if config.body_crc {
        header.frame_body_crc = CRC32.checksum(msg);
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + msg.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(msg);
    out
}

/// Frames and writes a marshaled message.
pub async fn write_frame<W>(
    writer: &mut W,
    headers_len: usize,
    msg: &[u8],
    config: &FrameWriteConfig,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let wire = encode_frame(headers_len, msg, config);
    writer.write_all(&wire).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        FRAME_HEADER_LEN, FrameReadConfig, FrameWriteConfig, SecurityProvider, encode_frame,
        read_frame,
    };
    use crate::error::TransportError;

    fn write_config(header_crc: bool, body_crc: bool) -> FrameWriteConfig {
        FrameWriteConfig { security_provider: SecurityProvider::None, header_crc, body_crc }
    }

    fn read_config(header_crc: bool, body_crc: bool) -> FrameReadConfig {
        FrameReadConfig {
            check_header_crc: header_crc,
            check_body_crc: body_crc,
            ..FrameReadConfig::default()
        }
    }

    async fn decode(data: &[u8], config: FrameReadConfig) -> Result<Vec<u8>, TransportError> {
        let mut input = data;
        read_frame(&mut input, &config).await.map(|(_, body)| body.to_vec())
    }

    #[tokio::test]
    async fn roundtrip_with_both_crcs() {
        let msg = b"headersbody!";
        let wire = encode_frame(7, msg, &write_config(true, true));
        assert_eq!(wire.len(), FRAME_HEADER_LEN + msg.len());

        let body = decode(&wire, read_config(true, true)).await.unwrap();
        assert_eq!(body, msg);
    }

    #[tokio::test]
    async fn header_tamper_fails_only_with_header_crc() {
        let mut wire = encode_frame(0, b"string", &write_config(true, true));
        wire[5] = b'2';

        let err = decode(&wire, read_config(true, false)).await.unwrap_err();
        assert!(matches!(err, TransportError::Format(_)));

        decode(&wire, read_config(false, true)).await.unwrap();
    }

    #[tokio::test]
    async fn body_tamper_fails_only_with_body_crc() {
        let mut wire = encode_frame(0, b"string", &write_config(true, true));
        let last = wire.len() - 1;
        wire[last] = b'1';

        let err = decode(&wire, read_config(false, true)).await.unwrap_err();
        assert!(matches!(err, TransportError::Format(_)));

        decode(&wire, read_config(true, false)).await.unwrap();
    }

    #[tokio::test]
    async fn every_header_byte_is_covered_by_crc8() {
        let wire = encode_frame(3, b"abcdef", &write_config(true, false));
        for index in 0..FRAME_HEADER_LEN {
            if (8..12).contains(&index) {
                // The body crc field is zeroed during the header check.
                continue;
            }
            let mut tampered = wire.clone();
            tampered[index] ^= 0x01;
            let result = decode(&tampered, read_config(true, false)).await;
            assert!(result.is_err(), "flipping header byte {index} must fail");
        }
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let mut wire = encode_frame(0, b"x", &write_config(false, false));
        wire[0..4].copy_from_slice(&u32::MAX.to_le_bytes());

        let config = FrameReadConfig { check_header_crc: false, ..FrameReadConfig::default() };
        let mut input = &wire[..];
        let err = read_frame(&mut input, &config).await.unwrap_err();
        assert!(matches!(err, TransportError::Format(_)));
    }
}
