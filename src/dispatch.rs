// src/dispatch.rs

//! Routes parsed deliveries to the right per-stream handler and fans the
//! resulting canonical events out to every registered sink, in registration
//! order.

use std::time::Instant;

use crate::handler::EventHandler;
use crate::protocol::Delivery;
use crate::sink::EventSink;

pub struct Dispatcher {
    handlers: Vec<EventHandler>,
    sinks: Vec<Box<dyn EventSink>>,
}

/// Maps the external event names carried on the wire to the internal stream
/// name its handler is registered under.
fn stream_for(event_name: &str) -> Option<&'static str> {
    match event_name {
        "add_order" => Some("add"),
        "remove_order" => Some("rm"),
        "skn" => Some("skn"),
        "spr" => Some("spr"),
        "refresh_express_option" => Some("po"),
        _ => None,
    }
}

impl Dispatcher {
    /// Builds a dispatcher wired to the five streams this feed understands,
    /// each with its own retention window.
    pub fn new(retention_secs: f64) -> Self {
        let handlers = vec![
            EventHandler::new("add", retention_secs),
            EventHandler::new("rm", retention_secs),
            EventHandler::new("skn", retention_secs),
            EventHandler::new("spr", retention_secs),
            EventHandler::new("po", retention_secs),
        ];
        Self { handlers, sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Processes one delivery from `source_id`, fanning out the resulting
    /// event (if this was its first sighting) to every sink in order.
    pub async fn dispatch(&self, delivery: Delivery, source_id: u8) {
        let started = Instant::now();
        let Some(stream) = stream_for(&delivery.event_name) else {
            tracing::warn!(
                event_name = %delivery.event_name,
                source_id,
                elapsed_us = started.elapsed().as_micros() as u64,
                "unrecognized event name, dropping"
            );
            return;
        };
        let handler = self.handlers.iter().find(|h| h.name() == stream).expect("every mapped stream has a handler");

        if let Some(event) = handler.process(&delivery.args, source_id, delivery.receive_time) {
            for sink in &self.sinks {
                if let Err(e) = sink.publish(&event).await {
                    tracing::warn!(error = %e, event_type = event.event_type, "sink publish failed");
                }
            }
        }

        tracing::trace!(
            event_name = %delivery.event_name,
            source_id,
            elapsed_us = started.elapsed().as_micros() as u64,
            "dispatched"
        );
    }

    /// Sweeps every handler's dedup table, logging eviction stats per stream.
    pub fn sweep_all(&self, now: f64) {
        for handler in &self.handlers {
            let stats = handler.sweep(now);
            if stats.evicted > 0 {
                tracing::debug!(
                    stream = handler.name(),
                    evicted = stats.evicted,
                    min_span = stats.min_span,
                    avg_span = stats.avg_span,
                    max_span = stats.max_span,
                    "sweep complete"
                );
            }
        }
    }
}
