//! End-to-end transport scenarios over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use weft_harness::{self_signed_identity, socket_pair};
use weft_transport::{
    Actor, ClientConfig, ClientTls, Connection, FrameReadConfig, HeaderId, Message,
    MessageHeaders, Relay, RelayConfig, SecurityNegotiationHeader, SecurityProvider, Server,
    ServerConfig, TransportError, frame,
};

fn echo_callback() -> weft_transport::MessageCallback {
    Arc::new(|connection: Connection, request| {
        tokio::spawn(async move {
            let headers = MessageHeaders {
                relates_to: request.headers.id,
                actor: request.headers.actor,
                action: "TEST_REPLY".to_string(),
                ..MessageHeaders::default()
            };
            let mut body: Vec<u8> = request.body.to_vec();
            body.reverse();
            let mut reply = Message::with_body(headers, body);
            if let Err(err) = connection.send_one_way(&mut reply).await {
                tracing::error!(%err, "echo reply failed");
            }
        });
    })
}

async fn start_echo_server(tls: Option<Arc<rustls::ServerConfig>>) -> (Arc<Server>, String) {
    let config = ServerConfig { tls, message_callback: Some(echo_callback()), ..ServerConfig::default() };
    let server = Arc::new(Server::listen("127.0.0.1:0", config).await.unwrap());
    let addr = server.local_addr().unwrap().to_string();

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    (server, addr)
}

fn test_request() -> Message {
    let headers = MessageHeaders {
        actor: Actor::GENERIC_TEST_ACTOR,
        action: "TEST".to_string(),
        ..MessageHeaders::default()
    };
    Message::with_body(headers, vec![1u8, 2, 3, 4])
}

#[tokio::test]
async fn request_reply_echo() {
    let (_server, addr) = start_echo_server(None).await;

    let client = Connection::dial(&addr, ClientConfig::default()).await.unwrap();
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let mut request = test_request();
    let reply = client.request_reply(&mut request).await.unwrap();

    assert_eq!(reply.headers.action, "TEST_REPLY");
    assert_eq!(reply.headers.relates_to, request.headers.id);
    assert_eq!(reply.body.as_ref(), [4, 3, 2, 1]);

    client.close().await;
}

#[tokio::test]
async fn heartbeat_round_trip() {
    let (_server, addr) = start_echo_server(None).await;

    let client = Connection::dial(&addr, ClientConfig::default()).await.unwrap();
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let elapsed = client.ping().await.unwrap();
    assert!(elapsed > Duration::ZERO);

    client.close().await;
}

#[tokio::test]
async fn cancelled_request_unblocks_and_close_is_safe() {
    // A server that accepts but never answers.
    let server = Arc::new(
        Server::listen("127.0.0.1:0", ServerConfig::default()).await.unwrap(),
    );
    let addr = server.local_addr().unwrap().to_string();
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    let client = Connection::dial(&addr, ClientConfig::default()).await.unwrap();
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let mut request = test_request();
    let outcome =
        tokio::time::timeout(Duration::from_secs(1), client.request_reply(&mut request)).await;
    assert!(outcome.is_err(), "request must still be pending at the timeout");

    client.close().await;
    client.close().await;
}

#[tokio::test]
async fn close_cancels_pending_request() {
    let server = Arc::new(
        Server::listen("127.0.0.1:0", ServerConfig::default()).await.unwrap(),
    );
    let addr = server.local_addr().unwrap().to_string();
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    let client = Connection::dial(&addr, ClientConfig::default()).await.unwrap();
    let closer = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        closer.close().await;
    });

    let mut request = test_request();
    let err = client.request_reply(&mut request).await.unwrap_err();
    assert_eq!(err, TransportError::Cancelled);
}

#[tokio::test]
async fn first_cleartext_frame_has_header_crc_and_no_provider() {
    let (client_sock, mut observer) = socket_pair().await.unwrap();

    tokio::spawn(async move {
        // The connect side sends its transport init immediately.
        let _ = Connection::connect(client_sock, ClientConfig::default()).await;
    });

    let config = FrameReadConfig::default();
    let (header, body) = frame::read_frame(&mut observer, &config).await.unwrap();
    assert_eq!(header.security_provider_mask, SecurityProvider::None as u8);

    let headers = MessageHeaders::parse(&body[..usize::from(header.headers_length)]).unwrap();
    assert_eq!(headers.actor, Actor::TRANSPORT);
    assert!(headers.high_priority);
}

#[tokio::test]
async fn tls_handshake_frames_carry_ssl_mask_and_negotiation_header() {
    let identity = self_signed_identity().unwrap();
    let (_server, addr) = start_echo_server(Some(identity.server)).await;

    // Man-in-the-middle observer: parse the client's first frame, then
    // shuttle raw bytes.
    let tap = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tap_addr = tap.local_addr().unwrap().to_string();
    let (first_frame_tx, first_frame_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut downstream, _) = tap.accept().await.unwrap();
        let mut upstream = TcpStream::connect(addr).await.unwrap();

        let config = FrameReadConfig {
            check_header_crc: false,
            check_body_crc: false,
            ..FrameReadConfig::default()
        };
        let (header, body) = frame::read_frame(&mut downstream, &config).await.unwrap();
        let body = body.freeze();

        // Replay the captured frame upstream verbatim, then go
        // transparent.
        let mut raw = Vec::with_capacity(12 + body.len());
        raw.extend_from_slice(&header.frame_length.to_le_bytes());
        raw.push(header.security_provider_mask);
        raw.push(header.frame_header_crc);
        raw.extend_from_slice(&header.headers_length.to_le_bytes());
        raw.extend_from_slice(&header.frame_body_crc.to_le_bytes());
        raw.extend_from_slice(&body);
        upstream.write_all(&raw).await.unwrap();

        let _ = first_frame_tx.send((header, body));
        let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
    });

    let tls = ClientTls { config: identity.client, server_name: identity.server_name };
    let client = Connection::dial(
        &tap_addr,
        ClientConfig { tls: Some(tls), ..ClientConfig::default() },
    )
    .await
    .unwrap();
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // The first outbound frame: ssl provider mask plus the security
    // negotiation header with both framing flags set.
    let (first_header, first_body) = first_frame_rx.await.unwrap();
    assert_eq!(first_header.security_provider_mask, SecurityProvider::Ssl as u8);
    let headers =
        MessageHeaders::parse(&first_body[..usize::from(first_header.headers_length)]).unwrap();
    assert_eq!(headers.actor, Actor::SECURITY_CONTEXT);
    let negotiation: &SecurityNegotiationHeader =
        headers.first_custom(HeaderId::SECURITY_NEGOTIATION).unwrap();
    assert!(negotiation.x509_extra_framing_enabled);
    assert!(negotiation.framing_protection_enabled);

    // The tunnel still works end to end: no negotiation header reaches
    // the application messages, and echo round-trips.
    let mut request = test_request();
    let reply = client.request_reply(&mut request).await.unwrap();
    assert_eq!(reply.body.as_ref(), [4, 3, 2, 1]);
    assert!(
        reply.headers.custom_headers(HeaderId::SECURITY_NEGOTIATION).is_empty(),
        "no negotiation headers after the handshake"
    );

    client.close().await;
}

#[tokio::test]
async fn relay_filter_can_drop_messages() {
    let (_server, addr) = start_echo_server(None).await;

    let upstream_addr = addr.clone();
    let relay = Arc::new(
        Relay::listen(
            "127.0.0.1:0",
            RelayConfig {
                base: weft_transport::Config::default(),
                tls: None,
                find_upstream: Arc::new(move |_headers| {
                    let addr = upstream_addr.clone();
                    Box::pin(async move {
                        let stream = TcpStream::connect(addr).await?;
                        Ok((stream, ClientConfig::default()))
                    })
                }),
                filter: Some(Arc::new(|message| {
                    if message.headers.action == "DROP_ME" {
                        return None;
                    }
                    Some(Message::with_body(message.headers.clone(), message.body.clone()))
                })),
            },
        )
        .await
        .unwrap(),
    );
    let relay_addr = relay.local_addr().unwrap().to_string();
    let serving = Arc::clone(&relay);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    let client = Connection::dial(&relay_addr, ClientConfig::default()).await.unwrap();
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // Ordinary traffic passes the filter.
    let mut request = test_request();
    let reply = client.request_reply(&mut request).await.unwrap();
    assert_eq!(reply.body.as_ref(), [4, 3, 2, 1]);

    // Filtered traffic never reaches the echo server.
    let headers = MessageHeaders {
        actor: Actor::GENERIC_TEST_ACTOR,
        action: "DROP_ME".to_string(),
        ..MessageHeaders::default()
    };
    let mut dropped = Message::with_body(headers, vec![9u8]);
    let outcome =
        tokio::time::timeout(Duration::from_millis(500), client.request_reply(&mut dropped)).await;
    assert!(outcome.is_err(), "dropped request must not be answered");

    client.close().await;
}

#[tokio::test]
async fn relay_forwards_request_reply() {
    let (_server, addr) = start_echo_server(None).await;

    let upstream_addr = addr.clone();
    let relay = Arc::new(
        Relay::listen(
            "127.0.0.1:0",
            RelayConfig {
                base: weft_transport::Config::default(),
                tls: None,
                find_upstream: Arc::new(move |_headers| {
                    let addr = upstream_addr.clone();
                    Box::pin(async move {
                        let stream = TcpStream::connect(addr).await?;
                        Ok((stream, ClientConfig::default()))
                    })
                }),
                filter: None,
            },
        )
        .await
        .unwrap(),
    );
    let relay_addr = relay.local_addr().unwrap().to_string();
    let serving = Arc::clone(&relay);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    let client = Connection::dial(&relay_addr, ClientConfig::default()).await.unwrap();
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let mut request = test_request();
    let reply = client.request_reply(&mut request).await.unwrap();
    assert_eq!(reply.body.as_ref(), [4, 3, 2, 1]);

    client.close().await;
}
