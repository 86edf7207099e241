// tests/protocol_handshake.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use bitcoinde_feed::frame;
use bitcoinde_feed::protocol::{self, accept_key, ProtocolVariant};

/// Reads from `server` up to and including the blank line that ends an HTTP
/// request/header block, returning everything read as a string.
async fn read_until_blank_line(server: &mut (impl tokio::io::AsyncRead + Unpin)) -> String {
    let mut buf = [0u8; 1];
    let mut all = Vec::new();
    loop {
        let n = server.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        all.push(buf[0]);
        if all.ends_with(b"\r\n\r\n") {
            return String::from_utf8_lossy(&all).into_owned();
        }
    }
}

fn extract_client_key(request: &str) -> String {
    request
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key:"))
        .map(|v| v.trim().to_string())
        .expect("request carries a Sec-WebSocket-Key header")
}

#[tokio::test]
async fn v09_key_mismatch_causes_connection_to_error_out() {
    let (client, mut server) = duplex(8192);
    let (r, w) = tokio::io::split(client);
    let close = Arc::new(Notify::new());
    let (tx, _rx) = mpsc::channel(8);
    let reached_raw = Arc::new(AtomicBool::new(false));

    let handle = tokio::spawn(protocol::run(ProtocolVariant::V09, r, w, tx, close, reached_raw.clone()));

    // Initial HTTP poll.
    read_until_blank_line(&mut server).await;
    server
        .write_all(b"HTTP/1.1 200 OK\r\n\r\n38\r\n01234567890123456789:15:10:websocket,xhr-polling\r\n")
        .await
        .unwrap();

    // Respond to the upgrade request with a deliberately wrong accept key.
    read_until_blank_line(&mut server).await;
    server
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: not-the-right-value\r\n\r\n")
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(result.is_err(), "a mismatched Sec-WebSocket-Accept must fail the handshake");
    assert!(!reached_raw.load(Ordering::Relaxed), "a rejected handshake must not mark the raw loop reached");
}

#[tokio::test]
async fn v20_pong_frame_is_delivered_and_does_not_crash_the_loop() {
    let (client, mut server) = duplex(8192);
    let (r, w) = tokio::io::split(client);
    let close = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::channel(8);
    let reached_raw = Arc::new(AtomicBool::new(false));

    let handle = tokio::spawn(protocol::run(ProtocolVariant::V20, r, w, tx, close.clone(), reached_raw.clone()));

    // Initial polling handshake.
    read_until_blank_line(&mut server).await;
    let body = r#"{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":5000}"#;
    server
        .write_all(format!("HTTP/1.1 200 OK\r\nSet-Cookie: io=abc; Path=/\r\n\r\n{body}\r\n").as_bytes())
        .await
        .unwrap();

    // Compute the real accept key from the client's actual
    // Sec-WebSocket-Key so the handshake succeeds.
    let upgrade_request = read_until_blank_line(&mut server).await;
    let client_key = extract_client_key(&upgrade_request);
    let accept = accept_key(&client_key);
    server
        .write_all(format!("HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {accept}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    // Deliver a market event frame; the client should forward it.
    let frame = frame::encode_client_frame(br#"42/market,["add_order",{"id":"1"}]"#);
    server.write_all(&frame).await.unwrap();

    let delivery = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().expect("delivery forwarded");
    assert_eq!(delivery.event_name, "add_order");
    assert!(reached_raw.load(Ordering::Relaxed), "raw loop must be marked reached once frames are flowing");

    close.notify_waiters();
    let _ = timeout(Duration::from_secs(1), handle).await;
}
