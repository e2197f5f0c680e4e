//! Front-door message relay.
//!
//! Accepts a socket, peels its first frame in cleartext to learn who is
//! knocking, asks the caller for an upstream, then pumps frames both
//! ways. Each pumped frame is re-framed with the destination leg's
//! write config, and an optional filter can rewrite or drop messages in
//! flight.
//!
//! When the downstream is TLS, the peeled first frame is the start of
//! the tunnelled handshake and is handed to the secure channel adapter;
//! otherwise it is forwarded to the upstream verbatim.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf, split};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::connection::{BoxedStream, ClientConfig, Config, client_stream, server_stream};
use crate::error::TransportError;
use crate::frame::{FrameReadConfig, FrameWriteConfig, read_frame, write_frame};
use crate::headers::MessageHeaders;
use crate::message::{ByteArrayMessage, Message};

/// Picks the upstream for an accepted connection based on its first
/// message's headers.
pub type FindUpstream = Arc<
    dyn Fn(
            &MessageHeaders,
        ) -> Pin<
            Box<dyn Future<Output = Result<(TcpStream, ClientConfig), TransportError>> + Send>,
        > + Send
        + Sync,
>;

/// Rewrites a relayed message; returning `None` drops it.
pub type MessageFilter = Arc<dyn Fn(&ByteArrayMessage) -> Option<Message> + Send + Sync>;

/// Configuration for a relay listener.
#[derive(Clone)]
pub struct RelayConfig {
    /// Frame-level knobs for the downstream leg.
    pub base: Config,
    /// TLS identity presented to downstream peers.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Upstream selection callback.
    pub find_upstream: FindUpstream,
    /// Optional message rewrite/drop hook, applied in both directions.
    pub filter: Option<MessageFilter>,
}

/// A message relay bound to a TCP listener.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
}

impl Relay {
    /// Binds a relay listener on `addr`.
    pub async fn listen(
        addr: impl ToSocketAddrs,
        config: RelayConfig,
    ) -> Result<Relay, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Relay { listener, config })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Transient accept errors are logged and retried.
    pub async fn serve(&self) -> Result<(), TransportError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle(stream, config).await {
                            tracing::info!(%peer, %err, "relay leg ended");
                        }
                    });
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    tracing::warn!(%err, "transient accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn handle(mut downstream: TcpStream, config: RelayConfig) -> Result<(), TransportError> {
    // Peel the first frame in cleartext to learn who is knocking.
    let first_read = FrameReadConfig {
        check_header_crc: true,
        check_body_crc: false,
        max_frame_size: config.base.max_frame_size,
    };
    let (first_header, first_body) = read_frame(&mut downstream, &first_read).await?;
    let headers_len = usize::from(first_header.headers_length);
    let first_headers = MessageHeaders::parse(&first_body[..headers_len])?;
    let init_body = &first_body[headers_len..];

    let down_parts =
        server_stream(downstream, &config.base, config.tls.as_ref(), init_body).await?;

    let (upstream, upstream_config) = (config.find_upstream)(&first_headers).await?;
    let mut up_parts =
        client_stream(upstream, &upstream_config.base, upstream_config.tls.as_ref()).await?;
    up_parts.send_transport_init(upstream_config.base.instance).await?;

    // Without TLS the peeled frame was a real first message; forward it.
    if config.tls.is_none() {
        let message = Message::with_body(first_headers, init_body.to_vec());
        let (header_len, bytes) = message.marshal()?;
        write_frame(&mut up_parts.stream, header_len, &bytes, &up_parts.write_cfg).await?;
    }

    let (down_read, down_write) = split(down_parts.stream);
    let (up_read, up_write) = split(up_parts.stream);

    let filter = config.filter.clone();
    let mut forward = tokio::spawn(pump(
        down_read,
        down_parts.read_cfg,
        up_write,
        up_parts.write_cfg,
        filter.clone(),
    ));
    let mut backward = tokio::spawn(pump(
        up_read,
        up_parts.read_cfg,
        down_write,
        down_parts.write_cfg,
        filter,
    ));

    // First leg to finish ends the relay; the other is torn down.
    let result = tokio::select! {
        first = &mut forward => first,
        first = &mut backward => first,
    };
    forward.abort();
    backward.abort();
    result.unwrap_or(Err(TransportError::Closed))
}

async fn pump(
    mut src: ReadHalf<BoxedStream>,
    src_cfg: FrameReadConfig,
    mut dst: WriteHalf<BoxedStream>,
    dst_cfg: FrameWriteConfig,
    filter: Option<MessageFilter>,
) -> Result<(), TransportError> {
    loop {
        let (frame_header, body) = read_frame(&mut src, &src_cfg).await?;
        let mut body = body.freeze();
        let headers_bytes = body.split_to(usize::from(frame_header.headers_length));
        let headers = MessageHeaders::parse(&headers_bytes)?;

        let message = ByteArrayMessage { headers, body };
        let outgoing = match &filter {
            Some(filter) => match filter(&message) {
                Some(rewritten) => rewritten,
                None => continue,
            },
            None => Message::with_body(message.headers, message.body),
        };

        let (header_len, bytes) = outgoing.marshal()?;
        write_frame(&mut dst, header_len, &bytes, &dst_cfg).await?;
    }
}
