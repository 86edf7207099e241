// src/protocol/v09.rs

//! Protocol variant V09: a socket.io 0.9-style handshake — a single HTTP poll
//! that yields a handshake nonce, followed by a WebSocket upgrade on
//! `/socket.io/1/websocket/<nonce>` and a raw frame loop with a 25s
//! heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::frame::{self, Opcode};
use crate::util::now_secs;

use super::{accept_key, Delivery};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

pub async fn run<R, W>(
    reader: R,
    mut writer: W,
    tx: mpsc::Sender<Delivery>,
    close: Arc<Notify>,
    reached_raw: Arc<AtomicBool>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut r = BufReader::new(reader);

    // Initial HTTP poll for the handshake nonce.
    let ms = (now_secs() * 1000.0) as i64;
    writer
        .write_all(format!("GET /socket.io/1/?t={ms} HTTP/1.1\r\n\r\n").as_bytes())
        .await?;

    let mut line = String::new();
    read_line(&mut r, &mut line).await?;
    if !line.contains("HTTP/1.1 200") {
        bail!("V09 poll rejected: {}", line.trim_end());
    }

    // Consume poll response headers until the blank line.
    loop {
        read_line(&mut r, &mut line).await?;
        if is_blank(&line) {
            break;
        }
    }

    // Chunked body length, then the "nonce:t1:t2:options" handshake line.
    read_line(&mut r, &mut line).await?;
    let _chunk_len: usize = line.trim().parse().context("invalid chunk length in V09 poll body")?;

    read_line(&mut r, &mut line).await?;
    let content = line.trim_end_matches(['\r', '\n']);
    let mut parts = content.splitn(4, ':');
    let nonce = parts.next().unwrap_or("").to_string();
    let _t1 = parts.next().unwrap_or("");
    let _t2 = parts.next().unwrap_or("");
    let options = parts.next().unwrap_or("");

    if nonce.len() != 20 || !options.contains("websocket") {
        bail!("V09 handshake content rejected: {content}");
    }

    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let client_key = BASE64.encode(key_bytes);

    let upgrade_req = format!(
        "GET /socket.io/1/websocket/{nonce} HTTP/1.1\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {client_key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Extensions: \r\n\
         Pragma: no-cache\r\n\
         Cache-Control: no-cache\r\n\r\n"
    );
    writer.write_all(upgrade_req.as_bytes()).await?;

    // Wait for the WebSocket upgrade response.
    read_line(&mut r, &mut line).await?;
    if !line.contains("HTTP/1.1 101") {
        bail!("V09 upgrade rejected: {}", line.trim_end());
    }

    let expected = accept_key(&client_key);
    let mut accepted = false;
    loop {
        read_line(&mut r, &mut line).await?;
        if is_blank(&line) {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if let Some(v) = strip_header(trimmed, "Sec-WebSocket-Accept:") {
            accepted = v == expected;
        }
    }

    if !accepted {
        tracing::warn!(reason = "key_mismatch", "V09 handshake rejected");
        bail!("key_mismatch");
    }
    tracing::info!("V09 connection accepted");
    reached_raw.store(true, Ordering::Relaxed);

    // Raw frame loop with a 25s heartbeat.
    let mut heartbeat = Box::pin(tokio::time::sleep(HEARTBEAT_INTERVAL));
    loop {
        tokio::select! {
            _ = close.notified() => return Ok(()),
            decoded = frame::decode_frame(&mut r) => {
                let decoded = decoded.context("V09 raw frame read failed")?;
                if matches!(decoded.opcode, Opcode::Close) {
                    return Ok(());
                }
                handle_raw_payload(&decoded.payload, &tx).await;
                heartbeat.as_mut().reset(Instant::now() + HEARTBEAT_INTERVAL);
            }
            _ = &mut heartbeat => {
                writer.write_all(&frame::encode_client_frame(b"2::")).await?;
                heartbeat.as_mut().reset(Instant::now() + HEARTBEAT_INTERVAL);
            }
        }
    }
}

async fn handle_raw_payload(payload: &[u8], tx: &mpsc::Sender<Delivery>) {
    let Some(&first) = payload.first() else { return };
    match first {
        0x2F => tracing::debug!(len = payload.len(), "V09 '/' frame (logged only)"),
        0x30 => tracing::debug!("V09 ping"),
        0x35 => {
            let mut i = 1;
            while i < payload.len() && payload[i] == b':' {
                i += 1;
            }
            match serde_json::from_slice::<serde_json::Value>(&payload[i..]) {
                Ok(v) => {
                    let name = v.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
                    let arg0 = v
                        .get("args")
                        .and_then(|a| a.as_array())
                        .and_then(|a| a.first())
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    if tx
                        .send(Delivery { event_name: name, args: arg0, receive_time: now_secs() })
                        .await
                        .is_err()
                    {
                        tracing::debug!("V09 delivery channel closed");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "V09 frame JSON parse failed"),
            }
        }
        other => tracing::debug!(opcode_byte = other, "V09 unknown opcode byte"),
    }
}

fn is_blank(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']).is_empty()
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name).map(str::trim)
}

async fn read_line<R: AsyncRead + Unpin>(r: &mut BufReader<R>, line: &mut String) -> Result<()> {
    line.clear();
    let n = r.read_line(line).await?;
    if n == 0 {
        bail!("connection closed before line was complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn rejects_non_200_poll_response() {
        let (client, mut server) = duplex(4096);
        let (r, w) = tokio::io::split(client);
        let close = Arc::new(Notify::new());
        let (tx, _rx) = mpsc::channel(8);
        let reached_raw = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run(r, w, tx, close, reached_raw));

        server
            .write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_err());
    }
}
