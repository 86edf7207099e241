// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, Notify};

use bitcoinde_feed::config::FeedConfig;
use bitcoinde_feed::dispatch::Dispatcher;
use bitcoinde_feed::sink::TcpBroadcastSink;
use bitcoinde_feed::source::{self, SourceDescriptor, TaggedDelivery};
use bitcoinde_feed::util::now_secs;

#[derive(Parser, Debug)]
#[command(about = "Dedupes and normalizes bitcoin.de market-data mirrors into one event stream")]
struct Cli {
    /// Port the broadcast sink listens on for downstream subscribers.
    #[arg(short, long, default_value_t = 5634)]
    port: u16,

    /// Path to the TOML source/retention config. Missing file falls back to
    /// the built-in four-mirror default.
    #[arg(long, default_value = "config/sources.toml")]
    config: String,

    /// Comma-separated subset of configured source ids to actually connect.
    #[arg(long, default_value = "1,2,3,4")]
    sources: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
    tracing::info!("starting bitcoinde_feed");

    let cli = Cli::parse();

    let cfg = match std::fs::read_to_string(&cli.config) {
        Ok(text) => FeedConfig::load(&text).with_context(|| format!("parsing {}", cli.config))?,
        Err(_) => {
            tracing::warn!(path = %cli.config, "config file not found, using defaults");
            FeedConfig::default()
        }
    };

    let enabled: Vec<u8> = cli
        .sources
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    let close = Arc::new(Notify::new());
    let mut dispatcher = Dispatcher::new(cfg.retention_secs);
    let sink = TcpBroadcastSink::bind(&format!("0.0.0.0:{}", cli.port), 1024).await?;
    dispatcher.add_sink(Box::new(sink));
    let dispatcher = Arc::new(dispatcher);

    let (tx, mut rx) = mpsc::channel::<TaggedDelivery>(1024);

    for source_cfg in cfg.sources.iter().filter(|s| enabled.contains(&s.id)) {
        let descriptor = SourceDescriptor {
            id: source_cfg.id,
            host: source_cfg.host.clone(),
            port: source_cfg.port,
            variant: source_cfg.variant.into(),
        };
        let tx = tx.clone();
        let close = close.clone();
        tokio::spawn(source::run_supervisor(descriptor, tx, close));
    }
    drop(tx);

    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(tagged) = rx.recv().await {
                dispatcher.dispatch(tagged.delivery, tagged.source_id).await;
            }
        });
    }

    {
        let dispatcher = dispatcher.clone();
        let sweep_interval = Duration::from_secs_f64(cfg.sweep_interval_secs);
        let close = close.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close.notified() => return,
                    _ = tokio::time::sleep(sweep_interval) => {
                        dispatcher.sweep_all(now_secs());
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    close.notify_waiters();

    Ok(())
}
