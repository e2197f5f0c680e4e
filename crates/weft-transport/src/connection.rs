//! Transport connection: socket ownership, the frame read loop, the
//! request table and the heartbeat subsystem.
//!
//! A connection owns its socket for its whole life. Exactly one task
//! drives [`Connection::run`]; writes may come from any task and are
//! serialized by the write lock. Closing is idempotent and drains every
//! pending request with a cancellation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use weft_codec::{Guid, weft_struct};

use crate::error::TransportError;
use crate::frame::{
    DEFAULT_MAX_FRAME_SIZE, FrameReadConfig, FrameWriteConfig, SecurityProvider, read_frame,
    write_frame,
};
use crate::headers::{Actor, MessageHeaders};
use crate::message::{ByteArrayMessage, Message, MessageCallback, MessageIdGenerator};
use crate::request_table::RequestTable;
use crate::secure::SecureChannel;

/// Any bidirectional byte stream a connection can own.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Frame-level knobs shared by clients and servers.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Skip verifying the CRC-8 on received frame headers.
    pub disable_check_frame_header_crc: bool,
    /// Skip generating the CRC-8 on sent frame headers.
    pub disable_generate_frame_header_crc: bool,
    /// Verify the CRC-32 on received frame bodies.
    pub check_frame_body_crc: bool,
    /// Generate the CRC-32 on sent frame bodies.
    pub generate_frame_body_crc: bool,
    /// Upper bound on a single frame.
    pub max_frame_size: u32,
    /// How long a heartbeat waits for its pong.
    pub ping_timeout: Duration,
    /// Listener instance advertised in the transport init message.
    pub instance: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            disable_check_frame_header_crc: false,
            disable_generate_frame_header_crc: false,
            check_frame_body_crc: false,
            generate_frame_body_crc: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            ping_timeout: Duration::from_secs(2),
            instance: 0,
        }
    }
}

/// TLS identity for the connecting side.
#[derive(Clone)]
pub struct ClientTls {
    /// Built rustls client configuration.
    pub config: Arc<rustls::ClientConfig>,
    /// Name the peer certificate must present.
    pub server_name: rustls::pki_types::ServerName<'static>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls").field("server_name", &self.server_name).finish()
    }
}

/// Configuration for an outbound connection.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Frame-level knobs.
    pub base: Config,
    /// TLS identity; `None` for a cleartext channel.
    pub tls: Option<ClientTls>,
    /// Callback for unsolicited messages.
    pub message_callback: Option<MessageCallback>,
}

weft_struct! {
    struct TransportInit {
        address: String,
        instance: u64,
        nonce: Guid,
        heartbeat_supported: bool,
        connection_feature_flags: u32,
    }
}

weft_struct! {
    struct Heartbeat {
        heartbeat_time_tick: i64,
    }
}

weft_struct! {
    struct ConnectionAuthBody {
        message: String,
    }
}

const ACTION_HEARTBEAT_REQUEST: &str = "HeartbeatRequest";
const ACTION_HEARTBEAT_RESPONSE: &str = "HeartbeatResponse";
const ACTION_CONNECTION_AUTH: &str = "ConnectionAuth";

/// Everything needed to promote a raw socket into a connection.
pub(crate) struct StreamParts {
    pub(crate) stream: BoxedStream,
    pub(crate) read_cfg: FrameReadConfig,
    pub(crate) write_cfg: FrameWriteConfig,
    pub(crate) generator: Arc<MessageIdGenerator>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl StreamParts {
    /// Sends the transport init message announcing this endpoint.
    pub(crate) async fn send_transport_init(
        &mut self,
        instance: u64,
    ) -> Result<(), TransportError> {
        let mut message = Message::typed(
            MessageHeaders {
                actor: Actor::TRANSPORT,
                high_priority: true,
                ..MessageHeaders::default()
            },
            &TransportInit {
                address: self.local_addr.map(|a| a.to_string()).unwrap_or_default(),
                instance,
                nonce: Guid::new_v4(),
                heartbeat_supported: true,
                connection_feature_flags: 1,
            },
        )?;
        self.generator.fill_message_id(&mut message);
        let (header_len, bytes) = message.marshal()?;
        write_frame(&mut self.stream, header_len, &bytes, &self.write_cfg).await
    }
}

fn frame_configs(base: &Config) -> (FrameReadConfig, FrameWriteConfig) {
    (
        FrameReadConfig {
            check_header_crc: !base.disable_check_frame_header_crc,
            check_body_crc: base.check_frame_body_crc,
            max_frame_size: base.max_frame_size,
        },
        FrameWriteConfig {
            security_provider: SecurityProvider::None,
            header_crc: !base.disable_generate_frame_header_crc,
            body_crc: base.generate_frame_body_crc,
        },
    )
}

// Over TLS both CRCs are off (the TLS MAC protects integrity) and every
// frame carries the ssl provider mask.
fn secure_configs(base: &Config) -> (FrameReadConfig, FrameWriteConfig) {
    (
        FrameReadConfig {
            check_header_crc: false,
            check_body_crc: false,
            max_frame_size: base.max_frame_size,
        },
        FrameWriteConfig {
            security_provider: SecurityProvider::Ssl,
            header_crc: false,
            body_crc: false,
        },
    )
}

pub(crate) async fn client_stream(
    stream: TcpStream,
    base: &Config,
    tls: Option<&ClientTls>,
) -> Result<StreamParts, TransportError> {
    let local_addr = stream.local_addr().ok();
    let peer_addr = stream.peer_addr().ok();
    let generator = Arc::new(MessageIdGenerator::new());

    let (stream, read_cfg, write_cfg): (BoxedStream, _, _) = match tls {
        None => {
            let (read_cfg, write_cfg) = frame_configs(base);
            (Box::new(stream), read_cfg, write_cfg)
        }
        Some(tls) => {
            let adapter = SecureChannel::new(stream, Arc::clone(&generator));
            let connector = TlsConnector::from(Arc::clone(&tls.config));
            let mut tls_stream = connector.connect(tls.server_name.clone(), adapter).await?;
            tls_stream.get_mut().0.mark_established();
            let (read_cfg, write_cfg) = secure_configs(base);
            (Box::new(tls_stream), read_cfg, write_cfg)
        }
    };

    Ok(StreamParts { stream, read_cfg, write_cfg, generator, local_addr, peer_addr })
}

pub(crate) async fn server_stream(
    stream: TcpStream,
    base: &Config,
    tls: Option<&Arc<rustls::ServerConfig>>,
    initial: &[u8],
) -> Result<StreamParts, TransportError> {
    let local_addr = stream.local_addr().ok();
    let peer_addr = stream.peer_addr().ok();
    let generator = Arc::new(MessageIdGenerator::new());

    let (stream, read_cfg, write_cfg): (BoxedStream, _, _) = match tls {
        None => {
            let (read_cfg, write_cfg) = frame_configs(base);
            (Box::new(stream), read_cfg, write_cfg)
        }
        Some(tls_config) => {
            let adapter =
                SecureChannel::with_buffered(stream, Arc::clone(&generator), initial);
            let acceptor = TlsAcceptor::from(Arc::clone(tls_config));
            let mut tls_stream = acceptor.accept(adapter).await?;
            tls_stream.get_mut().0.mark_established();
            let (read_cfg, write_cfg) = secure_configs(base);
            (Box::new(tls_stream), read_cfg, write_cfg)
        }
    };

    Ok(StreamParts { stream, read_cfg, write_cfg, generator, local_addr, peer_addr })
}

struct Inner {
    writer: Mutex<WriteHalf<BoxedStream>>,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    generator: Arc<MessageIdGenerator>,
    requests: RequestTable,
    read_cfg: FrameReadConfig,
    write_cfg: FrameWriteConfig,
    callback: parking_lot::RwLock<Option<MessageCallback>>,
    ping_lock: Mutex<()>,
    pong_tx: mpsc::Sender<i64>,
    pong_rx: Mutex<mpsc::Receiver<i64>>,
    ping_timeout: Duration,
    closed: AtomicBool,
    close_notify: Notify,
    fatal: parking_lot::Mutex<Option<TransportError>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// A transport connection over a plain or TLS-tunnelled socket.
///
/// Clones share the same underlying connection and may be used from any
/// task. Exactly one task must drive [`Connection::run`] for messages
/// to flow.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dials `addr` over TCP and promotes the socket.
    pub async fn dial(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Connection::connect(stream, config).await
    }

    /// Promotes an already-connected socket into a client connection.
    ///
    /// Performs the TLS handshake when configured, then sends the
    /// transport init message.
    pub async fn connect(
        stream: TcpStream,
        config: ClientConfig,
    ) -> Result<Connection, TransportError> {
        let parts = client_stream(stream, &config.base, config.tls.as_ref()).await?;
        Connection::from_parts(parts, &config.base, config.message_callback).await
    }

    pub(crate) async fn from_parts(
        mut parts: StreamParts,
        base: &Config,
        callback: Option<MessageCallback>,
    ) -> Result<Connection, TransportError> {
        parts.send_transport_init(base.instance).await?;
        let (reader, writer) = split(parts.stream);
        let (pong_tx, pong_rx) = mpsc::channel(1);

        let connection = Connection {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                reader: Mutex::new(Some(reader)),
                generator: parts.generator,
                requests: RequestTable::new(),
                read_cfg: parts.read_cfg,
                write_cfg: parts.write_cfg,
                callback: parking_lot::RwLock::new(callback),
                ping_lock: Mutex::new(()),
                pong_tx,
                pong_rx: Mutex::new(pong_rx),
                ping_timeout: base.ping_timeout,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                fatal: parking_lot::Mutex::new(None),
                local_addr: parts.local_addr,
                peer_addr: parts.peer_addr,
            }),
        };

        Ok(connection)
    }

    /// Local socket address, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Remote socket address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Installs the callback invoked for unsolicited messages.
    ///
    /// The callback runs on the read-loop task; long-running work
    /// should be spawned.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    /// Sends a message without waiting for a reply, assigning an id if
    /// the caller did not.
    pub async fn send_one_way(&self, message: &mut Message) -> Result<(), TransportError> {
        if let Some(fatal) = self.inner.fatal.lock().clone() {
            return Err(fatal);
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.inner.generator.fill_message_id(message);
        let (header_len, bytes) = message.marshal()?;

        let mut writer = self.inner.writer.lock().await;
        write_frame(&mut *writer, header_len, &bytes, &self.inner.write_cfg).await
    }

    /// Sends a request and waits for the correlated reply.
    ///
    /// The pending entry is installed before the request reaches the
    /// socket, so the reply cannot race past it. Dropping the returned
    /// future cancels the request; a reply arriving afterwards is
    /// logged and discarded.
    pub async fn request_reply(
        &self,
        message: &mut Message,
    ) -> Result<ByteArrayMessage, TransportError> {
        self.inner.generator.fill_message_id(message);
        message.headers.expects_reply = true;

        let pending = self.inner.requests.put(message.headers.id);
        self.send_one_way(message).await?;
        pending.wait().await
    }

    /// Sends a heartbeat and waits for its pong.
    ///
    /// Returns the round-trip time. Pings are serialized so at most one
    /// is outstanding per connection; an orphan pong left behind by a
    /// cancelled ping is drained on the next call. The echoed tick must
    /// match bit-exactly.
    pub async fn ping(&self) -> Result<Duration, TransportError> {
        let _serialized = self.inner.ping_lock.lock().await;
        let mut pong_rx = self.inner.pong_rx.lock().await;

        // Drain an orphan pong from a cancelled predecessor.
        while pong_rx.try_recv().is_ok() {}

        let tick = unix_nanos();
        let headers = MessageHeaders {
            actor: Actor::TRANSPORT,
            action: ACTION_HEARTBEAT_REQUEST.to_string(),
            high_priority: true,
            ..MessageHeaders::default()
        };
        let mut message = Message::typed(headers, &Heartbeat { heartbeat_time_tick: tick })?;
        self.send_one_way(&mut message).await?;

        let closed = self.inner.close_notify.notified();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            _ = closed => Err(TransportError::Closed),
            _ = tokio::time::sleep(self.inner.ping_timeout) => Err(TransportError::Cancelled),
            pong = pong_rx.recv() => match pong {
                None => Err(TransportError::Closed),
                Some(echoed) if echoed != tick => {
                    Err(TransportError::Protocol("heartbeat tick mismatch".into()))
                }
                Some(echoed) => {
                    Ok(Duration::from_nanos(unix_nanos().saturating_sub(echoed) as u64))
                }
            },
        }
    }

    /// Drives the read loop until EOF, error or close.
    ///
    /// The returned error is the connection's close cause. Call exactly
    /// once; a second call returns [`TransportError::Closed`].
    pub async fn run(&self) -> Result<(), TransportError> {
        let Some(mut reader) = self.inner.reader.lock().await.take() else {
            return Err(TransportError::Closed);
        };

        let result = self.read_loop(&mut reader).await;
        self.close().await;
        result
    }

    async fn read_loop(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
    ) -> Result<(), TransportError> {
        loop {
            let closed = self.inner.close_notify.notified();
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }

            let (frame_header, body) = tokio::select! {
                _ = closed => return Err(TransportError::Closed),
                frame = read_frame(reader, &self.inner.read_cfg) => frame?,
            };

            let mut body = body.freeze();
            let headers_bytes = body.split_to(usize::from(frame_header.headers_length));
            let headers = MessageHeaders::parse(&headers_bytes)?;
            let message = ByteArrayMessage { headers, body };

            if message.headers.actor == Actor::TRANSPORT {
                let connection = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection.handle_transport_message(message).await {
                        tracing::warn!(%err, "transport control message failed");
                    }
                });
                continue;
            }

            if message.headers.actor == Actor::TRANSPORT_SEND_TARGET
                && message.headers.action == ACTION_CONNECTION_AUTH
                && message.headers.error_code.is_failure()
            {
                let detail = message
                    .decode_body::<ConnectionAuthBody>()
                    .map(|body| body.message)
                    .unwrap_or_default();
                let err = TransportError::Protocol(format!(
                    "connection auth failure, error code {:?}: {detail}",
                    message.headers.error_code
                ));
                *self.inner.fatal.lock() = Some(err.clone());
                return Err(err);
            }

            match self.inner.requests.feed(message) {
                Ok(()) => {}
                Err(message) => {
                    // Layers above may correlate on their own tables
                    // (federation routing does), so unconsumed messages
                    // go to the callback even when they look like
                    // replies.
                    let callback = self.inner.callback.read().clone();
                    match callback {
                        Some(callback) => callback(self.clone(), message),
                        None if !message.headers.relates_to.is_empty() => {
                            tracing::warn!(relates_to = %message.headers.relates_to,
                                "dropping reply with no pending request");
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn handle_transport_message(
        &self,
        message: ByteArrayMessage,
    ) -> Result<(), TransportError> {
        match message.headers.action.as_str() {
            ACTION_HEARTBEAT_REQUEST => {
                // Echo the body back unchanged.
                let headers = MessageHeaders {
                    actor: Actor::TRANSPORT,
                    action: ACTION_HEARTBEAT_RESPONSE.to_string(),
                    high_priority: true,
                    ..MessageHeaders::default()
                };
                let mut response = Message::with_body(headers, message.body);
                self.send_one_way(&mut response).await
            }
            ACTION_HEARTBEAT_RESPONSE => {
                let pong = message.decode_body::<Heartbeat>()?;
                // A full channel means a previous ping gave up; the next
                // ping drains the orphan.
                let _ = self.inner.pong_tx.try_send(pong.heartbeat_time_tick);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Closes the connection. Safe to call any number of times.
    ///
    /// Pending requests are woken with a cancellation, outstanding
    /// pings observe the close, and the socket is shut down.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.close_notify.notify_waiters();
        self.inner.requests.close();

        let mut writer = self.inner.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(%err, "socket shutdown during close");
        }
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos() as i64)
}
