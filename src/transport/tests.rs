use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::channel::Channel;
use super::handlers::{HandlerRegistry, MessageHandler};
use super::handshake::{client_handshake, server_handshake};
use super::stage::FramePipeline;
use super::*;

fn config(cluster_id: &str) -> MessagingConfig {
    MessagingConfig {
        cluster_id: cluster_id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        shutdown_quiet_period_ms: 0,
        ..MessagingConfig::default()
    }
}

async fn started(config: MessagingConfig) -> MessagingService {
    let service = MessagingService::new(config).unwrap();
    service.start().await.unwrap();
    service
}

fn in_memory_pair(server: Arc<HandlerRegistry>) -> (Arc<Channel>, Arc<Channel>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let pipeline = Arc::new(FramePipeline::for_compression(CompressionAlgorithm::None, 1 << 20));
    let client = Channel::spawn(
        Box::new(a),
        ProtocolVersion::V2,
        Arc::clone(&pipeline),
        Arc::new(HandlerRegistry::default()),
        Address::new("server", 1),
        1 << 20,
    );
    let server = Channel::spawn(
        Box::new(b),
        ProtocolVersion::V2,
        pipeline,
        server,
        Address::new("client", 2),
        1 << 20,
    );
    (client, server)
}

// ============================================================================
// Address and codec
// ============================================================================

#[test]
fn test_address_parsing() {
    let address: Address = "10.0.0.1:26502".parse().unwrap();
    assert_eq!(address, Address::new("10.0.0.1", 26502));

    let v6: Address = "[::1]:80".parse().unwrap();
    assert_eq!(v6.host(), "::1");
    assert_eq!(v6.to_string(), "[::1]:80");

    assert_eq!("node-1".parse::<Address>().unwrap().port(), 0);
    assert!("host:port".parse::<Address>().is_err());
    assert!(":80".parse::<Address>().is_err());
}

#[test]
fn test_v2_uses_varint_lengths() {
    let request = ProtocolMessage::Request(ProtocolRequest {
        id: 42,
        sender: Address::new("127.0.0.1", 26502),
        subject: "raft-append".to_string(),
        payload: Bytes::from_static(b"entries"),
    });

    let v1 = ProtocolVersion::V1.encode(&request);
    let v2 = ProtocolVersion::V2.encode(&request);
    // Three length prefixes, each 4 bytes in V1 and 1 byte in V2.
    assert_eq!(v1.len() - v2.len(), 9);

    assert_eq!(ProtocolVersion::V1.decode(v1).unwrap(), request);
    assert_eq!(ProtocolVersion::V2.decode(v2).unwrap(), request);
}

#[test]
fn test_truncated_message_is_protocol_error() {
    let reply = ProtocolMessage::Reply(ProtocolReply::ok(1, Bytes::from_static(b"done")));
    let encoded = ProtocolVersion::V1.encode(&reply);

    let err = ProtocolVersion::V1
        .decode(encoded.slice(..encoded.len() - 1))
        .unwrap_err();
    assert!(matches!(err, MessagingError::ProtocolException(_)));
}

#[test]
fn test_preamble_depends_on_cluster_id() {
    assert_eq!(preamble("keel"), preamble("keel"));
    assert_ne!(preamble("keel"), preamble("other"));
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_negotiates_latest_version() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let server = tokio::spawn(async move { server_handshake(&mut server, 7).await });

    let version = client_handshake(&mut client, 7).await.unwrap();
    assert_eq!(version, ProtocolVersion::latest());
    assert_eq!(server.await.unwrap().unwrap(), ProtocolVersion::latest());
}

#[tokio::test]
async fn test_server_answers_unknown_version_with_its_latest() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let server = tokio::spawn(async move { server_handshake(&mut server, 7).await });

    client.write_all(&7i32.to_be_bytes()).await.unwrap();
    client.write_all(&99u16.to_be_bytes()).await.unwrap();

    let mut answer = [0u8; 6];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(i32::from_be_bytes([answer[0], answer[1], answer[2], answer[3]]), 7);
    assert_eq!(
        u16::from_be_bytes([answer[4], answer[5]]),
        ProtocolVersion::latest().version()
    );
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_server_keeps_older_client_version() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let server = tokio::spawn(async move { server_handshake(&mut server, 7).await });

    client.write_all(&7i32.to_be_bytes()).await.unwrap();
    client.write_all(&1u16.to_be_bytes()).await.unwrap();
    let mut answer = [0u8; 6];
    client.read_exact(&mut answer).await.unwrap();

    assert_eq!(server.await.unwrap().unwrap(), ProtocolVersion::V1);
}

#[tokio::test]
async fn test_server_rejects_foreign_preamble() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let server = tokio::spawn(async move { server_handshake(&mut server, 7).await });

    client.write_all(&8i32.to_be_bytes()).await.unwrap();
    client.write_all(&2u16.to_be_bytes()).await.unwrap();

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, MessagingError::HandshakeFailed(_)));
}

// ============================================================================
// Channel
// ============================================================================

#[tokio::test]
async fn test_channel_close_fails_pending_requests() {
    let handlers = Arc::new(HandlerRegistry::default());
    handlers.register(
        "stuck",
        MessageHandler::future(|_, _| futures::future::pending::<HandlerResult>()),
    );
    let (client, server) = in_memory_pair(handlers);

    let request = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send_and_receive(&Address::new("client", 2), "stuck", Bytes::new(), Duration::from_secs(10))
                .await
        })
    };
    while client.pending_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    server.close("test");
    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, MessagingError::ConnectionClosed(_)));
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_malformed_request_answered_with_protocol_exception() {
    let handlers = Arc::new(HandlerRegistry::default());
    let (mut raw, server_end) = tokio::io::duplex(1024);
    let _server = Channel::spawn(
        Box::new(server_end),
        ProtocolVersion::V2,
        Arc::new(FramePipeline::for_compression(CompressionAlgorithm::None, 1024)),
        handlers,
        Address::new("client", 2),
        1024,
    );

    // Request header with id 7, then a string length pointing past the end.
    let mut body = vec![0u8];
    body.extend_from_slice(&7i64.to_be_bytes());
    body.push(0x7f);
    raw.write_u32(body.len() as u32).await.unwrap();
    raw.write_all(&body).await.unwrap();

    let length = raw.read_u32().await.unwrap() as usize;
    let mut frame = vec![0u8; length];
    raw.read_exact(&mut frame).await.unwrap();

    match ProtocolVersion::V2.decode(Bytes::from(frame)).unwrap() {
        ProtocolMessage::Reply(reply) => {
            assert_eq!(reply.id, 7);
            assert_eq!(reply.status, ReplyStatus::ProtocolException);
        }
        other => panic!("expected a reply, got {other:?}"),
    }
}

// ============================================================================
// Messaging service
// ============================================================================

#[tokio::test]
async fn test_sync_handler_replies() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    server.register_sync_handler("echo", |_, payload| {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(&payload);
        Ok(Bytes::from(reply))
    });

    let reply = client
        .request(&server.address(), "echo", Bytes::from_static(b"hi"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"echo:hi");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_async_handler_sees_sender_address() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    server.register_async_handler("whoami", |sender, _| async move {
        Ok(Bytes::from(sender.to_string()))
    });

    let reply = client
        .send_and_receive(&server.address(), "whoami", Bytes::new(), false, None)
        .await
        .unwrap();
    assert_eq!(String::from_utf8(reply.to_vec()).unwrap(), client.address().to_string());
    // Transient connections do not outlive the request.
    assert_eq!(client.open_connections(), 0);
    assert_eq!(client.pooled_channel(&server.address(), "whoami").await, None);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_fire_and_forget_delivery() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.register_handler("notify", move |_, payload| {
        let _ = tx.send(payload);
    });

    client
        .send_async(&server.address(), "notify", Bytes::from_static(b"leader-changed"))
        .await
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received[..], b"leader-changed");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_missing_handler_keeps_channel() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    server.register_sync_handler("known", |_, _| Ok(Bytes::new()));

    client.request(&server.address(), "unknown", Bytes::new()).await.ok();
    let before = client.pooled_channel(&server.address(), "unknown").await;

    let err = client
        .request(&server.address(), "unknown", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoRemoteHandler(subject) if subject == "unknown"));
    assert!(before.is_some());
    assert_eq!(client.pooled_channel(&server.address(), "unknown").await, before);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_handler_failure_carries_message() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    server.register_sync_handler("fail", |_, _| Err("partition 3 is not leader".into()));

    let err = client
        .request(&server.address(), "fail", Bytes::new())
        .await
        .unwrap_err();
    match err {
        MessagingError::RemoteHandlerFailure(message) => {
            assert_eq!(message, "partition 3 is not leader")
        }
        other => panic!("unexpected error {other:?}"),
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unregistered_handler_no_longer_answers() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    server.register_sync_handler("ping", |_, _| Ok(Bytes::from_static(b"pong")));
    assert!(client.request(&server.address(), "ping", Bytes::new()).await.is_ok());

    server.unregister_handler("ping");
    let err = client
        .request(&server.address(), "ping", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoRemoteHandler(_)));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_timeout_closes_and_evicts_pooled_channel() {
    let server = started(config("keel")).await;
    let client = started(config("keel")).await;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        server.register_async_handler("op", move |_, _| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 1 {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Ok(Bytes::from_static(b"ok"))
            }
        });
    }
    let address = server.address();

    client.request(&address, "op", Bytes::new()).await.unwrap();
    let first = client.pooled_channel(&address, "op").await;
    assert!(first.is_some());

    let err = client
        .send_and_receive(&address, "op", Bytes::new(), true, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Timeout { .. }));
    assert_eq!(client.pooled_channel(&address, "op").await, None);

    client.request(&address, "op", Bytes::new()).await.unwrap();
    let second = client.pooled_channel(&address, "op").await;
    assert!(second.is_some());
    assert_ne!(first, second);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_mismatched_cluster_fails_handshake() {
    let server = started(config("cluster-a")).await;
    let client = started(config("cluster-b")).await;
    server.register_sync_handler("ping", |_, _| Ok(Bytes::new()));

    let err = client
        .request(&server.address(), "ping", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::HandshakeFailed(_)), "got {err:?}");
    assert_eq!(client.pooled_channel(&server.address(), "ping").await, None);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_send_to_self_skips_network() {
    let service = started(config("keel")).await;
    service.register_sync_handler("local", |_, payload| Ok(payload));

    let reply = service
        .request(&service.address(), "local", Bytes::from_static(b"loopback"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"loopback");
    assert_eq!(service.open_connections(), 0);
    assert_eq!(service.pooled_channel(&service.address(), "local").await, None);

    service.stop().await;
}

#[tokio::test]
async fn test_request_to_own_fire_and_forget_handler_returns_at_once() {
    let service = started(config("keel")).await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    service.register_handler("local-event", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        service.send_and_receive(
            &service.address(),
            "local-event",
            Bytes::from_static(b"tick"),
            false,
            Some(Duration::from_secs(60)),
        ),
    )
    .await
    .expect("request waited out its timeout")
    .unwrap();
    assert!(reply.is_empty());
    assert_eq!(received.load(Ordering::SeqCst), 1);

    service.stop().await;
}

#[tokio::test]
async fn test_gzip_compressed_exchange() {
    let compressed = MessagingConfig {
        compression: CompressionAlgorithm::Gzip,
        ..config("keel")
    };
    let server = started(compressed.clone()).await;
    let client = started(compressed).await;
    server.register_sync_handler("size", |_, payload| Ok(Bytes::from(payload.len().to_string())));

    let reply = client
        .request(&server.address(), "size", Bytes::from(vec![b'x'; 100_000]))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"100000");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_fails_open_requests() {
    let server = started(config("keel")).await;
    let client = Arc::new(started(config("keel")).await);
    server.register_async_handler("stuck", |_, _| futures::future::pending::<HandlerResult>());
    let address = server.address();

    let request = {
        let client = Arc::clone(&client);
        let address = address.clone();
        tokio::spawn(async move {
            client
                .send_and_receive(&address, "stuck", Bytes::new(), true, Some(Duration::from_secs(10)))
                .await
        })
    };
    while client.pooled_channel(&address, "stuck").await.is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.stop().await;
    match request.await.unwrap() {
        Err(MessagingError::ConnectionClosed(reason)) => {
            assert_eq!(reason, "MessagingService has been closed.")
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(!client.is_running());

    server.stop().await;
}

#[tokio::test]
async fn test_stopped_service_refuses_sends() {
    let service = MessagingService::new(config("keel")).unwrap();
    let err = service
        .request(&Address::new("127.0.0.1", 1), "ping", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NotRunning));
    assert_eq!(err.to_string(), "MessagingService is closed.");
}
