// src/source.rs

//! Supervises one mirror connection: connect, run the protocol state
//! machine, and on any failure or clean close reconnect with exponential
//! backoff. Each source tags every delivery it forwards with its own id so
//! downstream dedup can tell mirrors apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::protocol::{self, Delivery, ProtocolVariant};
use crate::transport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: u8,
    pub host: String,
    pub port: u16,
    pub variant: ProtocolVariant,
}

/// A delivery tagged with the mirror it arrived from.
#[derive(Debug, Clone)]
pub struct TaggedDelivery {
    pub delivery: Delivery,
    pub source_id: u8,
}

/// Runs `source` forever, reconnecting with exponential backoff (reset to
/// `INITIAL_BACKOFF` after any successful connection) until `close` fires.
pub async fn run_supervisor(
    source: SourceDescriptor,
    out: mpsc::Sender<TaggedDelivery>,
    close: Arc<Notify>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if out.is_closed() {
            return;
        }

        tracing::info!(source_id = source.id, host = %source.host, "connecting");
        let reached_raw = Arc::new(AtomicBool::new(false));
        let outcome = tokio::select! {
            _ = close.notified() => return,
            result = connect_and_run(&source, out.clone(), close.clone(), reached_raw.clone()) => result,
        };

        // Reset backoff whenever the handshake actually reached the raw
        // frame loop, regardless of how the connection eventually ended:
        // the raw loop almost always returns `Err` on disconnect (a read
        // failure), not a clean `Ok(())`, even after a long healthy run, so
        // gating the reset on `Ok(())` alone would let backoff ratchet up
        // to the cap and never come back down.
        let connected = reached_raw.load(Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                tracing::info!(source_id = source.id, "connection closed cleanly");
            }
            Err(e) => {
                tracing::warn!(source_id = source.id, error = %e, backoff_secs = backoff.as_secs_f64(), connected, "connection failed, backing off");
            }
        }
        if connected {
            backoff = INITIAL_BACKOFF;
        }

        tokio::select! {
            _ = close.notified() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, MAX_BACKOFF)
}

async fn connect_and_run(
    source: &SourceDescriptor,
    out: mpsc::Sender<TaggedDelivery>,
    close: Arc<Notify>,
    reached_raw: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let transport = transport::connect(&source.host, source.port).await?;
    let (read, write) = transport.split();

    let (tx, mut rx) = mpsc::channel::<Delivery>(256);
    let source_id = source.id;
    let forward = tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            if out.send(TaggedDelivery { delivery, source_id }).await.is_err() {
                break;
            }
        }
    });

    let result = protocol::run(source.variant, read, write, tx, close, reached_raw).await;
    forward.abort();
    result
}
