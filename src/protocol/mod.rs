// src/protocol/mod.rs

//! Protocol state machines. `ProtocolVariant` is a tagged variant plus a
//! shared framing/handshake helper (this module); each variant owns its own
//! state transitions (`v09`, `v20`).

pub mod v09;
pub mod v20;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};

/// RFC 6455's fixed handshake GUID.
const WS_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    V09,
    V20,
}

/// A single parsed payload handed upward to the dispatcher, tagged with the
/// time it was received off the wire. `source_id` is added by the
/// supervisor, not here — handshake activity stays internal to this module.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event_name: String,
    pub args: serde_json::Value,
    pub receive_time: f64,
}

/// Computes the expected `Sec-WebSocket-Accept` value for a given client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC);
    BASE64.encode(hasher.finalize())
}

/// Drives the handshake and raw frame loop for `variant` over `reader`/`writer`,
/// delivering parsed `(event_name, args, t)` tuples to `tx`. Returns once the
/// connection is closed, a protocol error occurs, or `close` is notified.
///
/// `reached_raw` is set once the handshake completes and the raw frame loop
/// is entered — before that point a failure is a handshake rejection, after
/// it a failure is just an ordinary mid-session disconnect. The supervisor
/// uses this distinction to decide whether to reset its reconnect backoff,
/// since the raw loop almost always ends in an I/O error (not a clean
/// `Ok(())`) even after hours of a perfectly healthy connection.
pub async fn run<R, W>(
    variant: ProtocolVariant,
    reader: R,
    writer: W,
    tx: mpsc::Sender<Delivery>,
    close: Arc<Notify>,
    reached_raw: Arc<AtomicBool>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match variant {
        ProtocolVariant::V09 => v09::run(reader, writer, tx, close, reached_raw).await,
        ProtocolVariant::V20 => v20::run(reader, writer, tx, close, reached_raw).await,
    }
}
