//! TCP acceptor: promotes accepted sockets into transport connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::connection::{Config, Connection, server_stream};
use crate::error::TransportError;
use crate::message::MessageCallback;

/// Configuration for an accepting endpoint.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Frame-level knobs.
    pub base: Config,
    /// TLS identity; `None` for a cleartext listener.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Callback for messages arriving on accepted connections.
    pub message_callback: Option<MessageCallback>,
}

/// A transport server bound to a TCP listener.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    callback: parking_lot::RwLock<Option<MessageCallback>>,
}

impl Server {
    /// Binds a listener on `addr`.
    pub async fn listen(
        addr: impl ToSocketAddrs,
        config: ServerConfig,
    ) -> Result<Server, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server::with_listener(listener, config))
    }

    /// Wraps an already-bound listener.
    pub fn with_listener(listener: TcpListener, config: ServerConfig) -> Server {
        let callback = parking_lot::RwLock::new(config.message_callback.clone());
        Server { listener, config, callback }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Replaces the message callback applied to connections accepted
    /// from now on.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Accept loop: promotes each socket into a connection and drives
    /// its read loop on a spawned task.
    ///
    /// Transient accept errors are logged and retried after a short
    /// pause; fatal listener errors end the loop.
    pub async fn serve(&self) -> Result<(), TransportError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let config = self.config.clone();
                    let callback = self.callback.read().clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle(stream, config, callback).await {
                            tracing::info!(%peer, %err, "connection ended");
                        }
                    });
                }
                Err(err) if is_transient(&err) => {
                    tracing::warn!(%err, "transient accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn handle(
    stream: TcpStream,
    config: ServerConfig,
    callback: Option<MessageCallback>,
) -> Result<(), TransportError> {
    let parts = server_stream(stream, &config.base, config.tls.as_ref(), &[]).await?;
    let connection = Connection::from_parts(parts, &config.base, callback).await?;
    connection.run().await
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
