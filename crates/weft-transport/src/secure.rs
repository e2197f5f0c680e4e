//! Secure channel adapter: tunnels TLS records through the frame layer.
//!
//! TLS handshake records never appear directly on the wire; a passive
//! observer only ever sees transport frames. This adapter sits between
//! the TLS engine and the raw socket:
//!
//! - handshake writes are wrapped into `SecurityContext` messages (the
//!   first one also carries the security negotiation header),
//! - handshake reads pull one frame and hand the TLS engine the body
//!   bytes past the headers region,
//! - once the handshake completes both directions pass through, since
//!   TLS records carry their own framing.
//!
//! Frame CRCs are off in both directions here; the TLS MAC protects
//! integrity once the channel is up, and the negotiation frames match
//! the secure write config (provider mask `ssl`, no CRC).
//!
//! The mode switch is per endpoint, so records a peer emits while still
//! inside its own handshake arrive framed, and records emitted after it
//! arrive raw. Session tickets sit exactly on that edge; server configs
//! used with this transport disable them (`send_tls13_tickets = 0`).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::frame::{
    FRAME_HEADER_LEN, FrameHeader, FrameReadConfig, FrameWriteConfig, SecurityProvider,
    decode_frame_header, encode_frame,
};
use crate::headers::{Actor, HeaderId, MessageHeaders, SecurityNegotiationHeader};
use crate::message::{Message, MessageIdGenerator};

/// Frame-tunnelling byte stream placed between the TLS engine and the
/// raw socket.
#[derive(Debug)]
pub(crate) struct SecureChannel<S> {
    io: S,
    generator: Arc<MessageIdGenerator>,
    established: bool,
    negotiation_sent: bool,

    // Tunnelled bytes already extracted for the TLS engine.
    read_buf: BytesMut,
    // In-progress frame read.
    header_buf: [u8; FRAME_HEADER_LEN],
    header_filled: usize,
    pending_header: Option<FrameHeader>,
    body_buf: BytesMut,
    body_filled: usize,

    // Framed bytes waiting to reach the socket, plus how many caller
    // bytes they represent.
    write_buf: Vec<u8>,
    write_pos: usize,
    write_granted: usize,

    read_cfg: FrameReadConfig,
    write_cfg: FrameWriteConfig,
}

impl<S> SecureChannel<S> {
    /// Wraps `io` for a connecting (client) endpoint.
    pub(crate) fn new(io: S, generator: Arc<MessageIdGenerator>) -> SecureChannel<S> {
        SecureChannel::with_buffered(io, generator, &[])
    }

    /// Wraps `io` for an accepting endpoint whose first frame body was
    /// already peeled off by a front-door accept helper.
    pub(crate) fn with_buffered(
        io: S,
        generator: Arc<MessageIdGenerator>,
        initial: &[u8],
    ) -> SecureChannel<S> {
        SecureChannel {
            io,
            generator,
            established: false,
            negotiation_sent: false,
            read_buf: BytesMut::from(initial),
            header_buf: [0; FRAME_HEADER_LEN],
            header_filled: 0,
            pending_header: None,
            body_buf: BytesMut::new(),
            body_filled: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            write_granted: 0,
            read_cfg: FrameReadConfig {
                check_header_crc: false,
                check_body_crc: false,
                ..FrameReadConfig::default()
            },
            write_cfg: FrameWriteConfig {
                security_provider: SecurityProvider::Ssl,
                header_crc: false,
                body_crc: false,
            },
        }
    }

    /// Switches both directions to pass-through once the TLS handshake
    /// has completed.
    pub(crate) fn mark_established(&mut self) {
        self.established = true;
    }

    fn wrap_handshake_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut headers = MessageHeaders {
            id: self.generator.next(),
            actor: Actor::SECURITY_CONTEXT,
            ..MessageHeaders::default()
        };

        if !self.negotiation_sent {
            headers.set_custom(
                HeaderId::SECURITY_NEGOTIATION,
                SecurityNegotiationHeader {
                    x509_extra_framing_enabled: true,
                    // Must stay true for frame-level protection to
                    // negotiate on every platform.
                    framing_protection_enabled: true,
                    ..SecurityNegotiationHeader::default()
                },
            );
        }

        let message = Message::with_body(headers, data.to_vec());
        let (header_len, bytes) = message.marshal().map_err(std::io::Error::other)?;

        self.write_buf = encode_frame(header_len, &bytes, &self.write_cfg);
        self.write_pos = 0;
        self.write_granted = data.len();
        self.negotiation_sent = true;
        Ok(())
    }
}

impl<S> AsyncRead for SecureChannel<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            // Bytes already tunnelled out of earlier frames win, even
            // after the handshake completes.
            if !this.read_buf.is_empty() {
                let take = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..take]);
                this.read_buf.advance(take);
                return Poll::Ready(Ok(()));
            }

            if this.established {
                return Pin::new(&mut this.io).poll_read(cx, buf);
            }

            // Pull the 12-byte frame header.
            while this.pending_header.is_none() {
                let mut header_space = ReadBuf::new(&mut this.header_buf[this.header_filled..]);
                ready!(Pin::new(&mut this.io).poll_read(cx, &mut header_space))?;
                let n = header_space.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                }
                this.header_filled += n;
                if this.header_filled == FRAME_HEADER_LEN {
                    let header = FrameHeader::from_bytes(this.header_buf);
                    decode_frame_header(header, &this.read_cfg)
                        .map_err(std::io::Error::other)?;
                    this.body_buf =
                        BytesMut::zeroed(header.frame_length as usize - FRAME_HEADER_LEN);
                    this.body_filled = 0;
                    this.pending_header = Some(header);
                }
            }

            // Pull the frame body.
            let header = match this.pending_header {
                Some(header) => header,
                None => continue,
            };
            while this.body_filled < this.body_buf.len() {
                let mut body_space = ReadBuf::new(&mut this.body_buf[this.body_filled..]);
                ready!(Pin::new(&mut this.io).poll_read(cx, &mut body_space))?;
                let n = body_space.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                }
                this.body_filled += n;
            }

            // Hand the TLS engine only the bytes past the headers region.
            this.body_buf.advance(usize::from(header.headers_length));
            this.read_buf = std::mem::take(&mut this.body_buf);
            this.pending_header = None;
            this.header_filled = 0;
        }
    }
}

impl<S> AsyncWrite for SecureChannel<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.established && this.write_buf.is_empty() {
            return Pin::new(&mut this.io).poll_write(cx, data);
        }

        if this.write_buf.is_empty() {
            this.wrap_handshake_bytes(data)?;
        }

        while this.write_pos < this.write_buf.len() {
            let n =
                ready!(Pin::new(&mut this.io).poll_write(cx, &this.write_buf[this.write_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            this.write_pos += n;
        }

        this.write_buf.clear();
        this.write_pos = 0;
        Poll::Ready(Ok(std::mem::take(&mut this.write_granted)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
