// src/protocol/v20.rs

//! Protocol variant V20: models engine.io protocol version 3 — an initial
//! polling exchange (with session cookie and an `upgrades`/`pingInterval`
//! probe) promoted to a WebSocket, followed by a raw frame loop that
//! subscribes to the market namespace and pings/pongs on `pingInterval`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use crate::frame::{self, Opcode};
use crate::util::now_secs;

use super::{accept_key, Delivery};

const MARKET_MARKER: &str = "42/market,";
const DEFAULT_PING_INTERVAL_SECS: f64 = 20.0;

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
    let mut cookie = String::new();
    let mut ping_interval = DEFAULT_PING_INTERVAL_SECS;

    // Poll until the session response carries upgrade/pingInterval info.
    loop {
        let ms = (now_secs() * 1000.0) as i64;
        let io_param = if cookie.is_empty() { String::new() } else { format!("&io={cookie}") };
        let req =
            format!("GET /socket.io/1/?EIO=3{io_param}&t={ms}-0&transport=polling HTTP/1.1\r\n\r\n");
        writer.write_all(req.as_bytes()).await?;

        let (code, upgrade_seen) = read_poll_response(&mut r, &mut cookie, &mut ping_interval).await?;
        if code != 200 {
            bail!("V20 poll failed: status {code}");
        }
        if upgrade_seen {
            break;
        }
    }

    // Send the WebSocket upgrade request.
    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let client_key = BASE64.encode(key_bytes);
    let ms = (now_secs() * 1000.0) as i64;
    let req = format!(
        "GET /socket.io/1/?EIO=3&transport=websocket&t={ms}-2{cookie} HTTP/1.1\r\n\
         Connection: Upgrade\r\n\
         Upgrade: Websocket\r\n\
         Sec-WebSocket-Key: {client_key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Pragma: no-cache\r\n\
         Cache-Control: no-cache\r\n\r\n"
    );
    writer.write_all(req.as_bytes()).await?;

    // Wait for the upgrade response.
    let mut line = String::new();
    read_line(&mut r, &mut line).await?;
    if !line.contains("HTTP/1.1 101") {
        bail!("V20 upgrade rejected: {}", line.trim_end());
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
        tracing::warn!(reason = "key_mismatch", "V20 handshake rejected");
        bail!("key_mismatch");
    }
    tracing::info!(ping_interval, "V20 connection accepted");
    reached_raw.store(true, Ordering::Relaxed);

    // Raw frame loop: subscribe once, then ping/pong on pingInterval.
    let mut subscribe_timer = Some(Box::pin(tokio::time::sleep(Duration::from_secs(2))));
    let mut ping_timer = Some(Box::pin(tokio::time::sleep(Duration::from_secs(3))));

    loop {
        tokio::select! {
            _ = close.notified() => return Ok(()),
            decoded = frame::decode_frame(&mut r) => {
                let decoded = decoded.context("V20 raw frame read failed")?;
                if matches!(decoded.opcode, Opcode::Close) {
                    return Ok(());
                }
                if let Some(next_ping_in) = handle_raw_payload(&decoded.payload, &tx, ping_interval).await {
                    ping_timer = Some(Box::pin(tokio::time::sleep(Duration::from_secs_f64(next_ping_in))));
                }
            }
            _ = pending_or(&mut subscribe_timer), if subscribe_timer.is_some() => {
                writer.write_all(&frame::encode_client_frame(b"40/market,")).await?;
                subscribe_timer = None;
            }
            _ = pending_or(&mut ping_timer), if ping_timer.is_some() => {
                writer.write_all(&frame::encode_client_frame(b"2")).await?;
                ping_timer = None;
            }
        }
    }
}

/// Awaits `timer` if armed, otherwise never resolves — lets `tokio::select!`
/// treat a one-shot/disarmed timer branch uniformly.
async fn pending_or(timer: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>) {
    match timer.as_mut() {
        Some(t) => t.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn handle_raw_payload(payload: &[u8], tx: &mpsc::Sender<Delivery>, ping_interval: f64) -> Option<f64> {
    if payload.len() == 1 && payload[0] == b'3' {
        return Some(ping_interval);
    }
    if payload.len() == 2 {
        let hint = u16::from_be_bytes([payload[0], payload[1]]);
        tracing::debug!(next_len_hint = hint, "V20 length-hint frame");
        return None;
    }

    let Ok(text) = std::str::from_utf8(payload) else {
        tracing::debug!("V20 frame payload is not valid UTF-8");
        return None;
    };

    let Some(idx) = text.find(MARKET_MARKER) else {
        return None;
    };
    let remainder = &text[idx + MARKET_MARKER.len()..];
    match serde_json::from_str::<serde_json::Value>(remainder) {
        Ok(serde_json::Value::Array(arr)) if arr.len() >= 2 => {
            if let Some(name) = arr[0].as_str() {
                let delivery = Delivery {
                    event_name: name.to_string(),
                    args: arr[1].clone(),
                    receive_time: now_secs(),
                };
                if tx.send(delivery).await.is_err() {
                    tracing::debug!("V20 delivery channel closed");
                }
            }
        }
        _ => tracing::debug!("V20 frame JSON parse failed"),
    }
    None
}

async fn read_poll_response<R: AsyncRead + Unpin>(
    r: &mut BufReader<R>,
    cookie: &mut String,
    ping_interval: &mut f64,
) -> Result<(u16, bool)> {
    let mut code: u16 = 0;
    let mut upgrade_seen = false;
    let mut line = String::new();

    // Status + header lines, up to the blank line.
    loop {
        read_line(r, &mut line).await?;
        if is_blank(&line) {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        scan_line(trimmed, cookie, ping_interval, &mut upgrade_seen, &mut code);
    }

    // Exactly one body line carries the session JSON for a 200 response.
    if code == 200 {
        read_line(r, &mut line).await?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        scan_line(trimmed, cookie, ping_interval, &mut upgrade_seen, &mut code);
    }

    Ok((code, upgrade_seen))
}

fn scan_line(line: &str, cookie: &mut String, ping_interval: &mut f64, upgrade_seen: &mut bool, code: &mut u16) {
    if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
        *code = rest.split(' ').next().unwrap_or("0").parse().unwrap_or(0);
        return;
    }
    if let Some(v) = line.strip_prefix("Set-Cookie:") {
        if let Some(eq) = v.find('=') {
            let after_eq = &v[eq + 1..];
            *cookie = after_eq.split(';').next().unwrap_or("").trim().to_string();
        }
        return;
    }
    if line.contains("\"upgrades\"") {
        *upgrade_seen = true;
    }
    if let Some(pos) = line.find("pingInterval") {
        let after = &line[pos + "pingInterval".len()..];
        if let Some(colon) = after.find(':') {
            let tail = &after[colon + 1..];
            let digits: String = tail.chars().skip_while(|c| !c.is_ascii_digit()).take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(ms) = digits.parse::<f64>() {
                *ping_interval = ms / 1100.0;
            }
        }
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
