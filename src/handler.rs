// src/handler.rs

//! Per-stream dedup handlers. Each handler owns one dedup table keyed by a
//! stream-specific fingerprint, normalizes payloads on first sighting, emits
//! the canonical `Event` exactly once, and accumulates later sightings as
//! observations. A periodic sweep evicts entries whose oldest observation
//! has aged out of the retention window.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::event::{Event, EventId, Observation};

/// Accumulated eviction statistics for one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    pub evicted: usize,
    pub min_span: f64,
    pub avg_span: f64,
    pub max_span: f64,
    pub per_source: HashMap<u8, usize>,
}

pub struct EventHandler {
    name: &'static str,
    interval: f64,
    table: DashMap<EventId, Event>,
}

impl EventHandler {
    pub fn new(name: &'static str, interval: f64) -> Self {
        Self { name, interval, table: DashMap::new() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Processes one `(data, src, t)` sighting. Returns `Some(event)` the
    /// first time a fingerprint is seen (to be fanned out once); `None` on
    /// every later sighting of the same fingerprint.
    pub fn process(&self, data: &Value, src: u8, t: f64) -> Option<Event> {
        let Some(id) = self.fingerprint(data) else {
            tracing::debug!(stream = self.name, "could not compute fingerprint, dropping event");
            return None;
        };

        if let Some(mut existing) = self.table.get_mut(&id) {
            existing.observations.push(Observation { arrival_time: t, source_id: src });
            return None;
        }

        let payload = self.normalize(data);
        let mut event = Event::new(id.clone(), self.name, t, payload);
        event.observations.push(Observation { arrival_time: t, source_id: src });
        self.table.insert(id, event.clone());
        Some(event)
    }

    fn fingerprint(&self, data: &Value) -> Option<EventId> {
        match self.name {
            "add" | "rm" => data.get("id").map(value_as_id_string).map(EventId::Str),
            "skn" | "spr" => data.get("uid").map(value_as_id_string).map(EventId::Str),
            "po" => data.as_object().map(|obj| EventId::Int(po_fingerprint(obj))),
            _ => None,
        }
    }

    fn normalize(&self, data: &Value) -> Value {
        match self.name {
            "add" => normalize_add(data),
            "po" => data.as_object().map(normalize_po).unwrap_or_else(|| Value::Object(Map::new())),
            // rm, skn, spr: payload passed through unchanged.
            _ => data.clone(),
        }
    }

    /// Removes entries whose oldest observation is older than `now - interval`,
    /// returning aggregate stats over everything removed in this pass.
    pub fn sweep(&self, now: f64) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut spans: Vec<f64> = Vec::new();

        self.table.retain(|_, ev| {
            let oldest = ev.observations.iter().map(|o| o.arrival_time).fold(f64::INFINITY, f64::min);
            if oldest < now - self.interval {
                stats.evicted += 1;
                let newest = ev.observations.iter().map(|o| o.arrival_time).fold(f64::NEG_INFINITY, f64::max);
                spans.push(newest - oldest);

                if let Some(first) = ev.observations.iter().min_by(|a, b| a.arrival_time.partial_cmp(&b.arrival_time).unwrap()) {
                    *stats.per_source.entry(first.source_id).or_insert(0) += 1;
                }
                false
            } else {
                true
            }
        });

        if !spans.is_empty() {
            stats.min_span = spans.iter().cloned().fold(f64::INFINITY, f64::min);
            stats.max_span = spans.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            stats.avg_span = spans.iter().sum::<f64>() / spans.len() as f64;
        }
        stats
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.len()
    }
}

/// The `po` (refresh-payment-option) fingerprint: an order-dependent
/// weighted integer sum over the payload's natural (insertion) iteration
/// order. This is very likely an accident of how the upstream feed builds
/// the payload rather than an intentional contract, but it is what
/// existing dedup state depends on (see DESIGN.md) — do not "fix" this to
/// sort by id without upstream confirmation.
pub fn po_fingerprint(data: &Map<String, Value>) -> i64 {
    let mut h: i64 = 0;
    for (j, (k, v)) in data.iter().enumerate() {
        let id: i64 = k.parse().unwrap_or(0);
        let fidor = v
            .get("is_trade_by_fidor_reservation_allowed")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .parse::<i64>()
            .unwrap_or(0);
        let m = fidor * 2 - 1;
        h += id * m * (j as i64 + 1);
    }
    h
}

/// `po = fidor + sepa*2` per sub-entry, keyed by its string id.
/// Reads the SEPA flag from the literal key `"u'is_trade_by_sepa_allowed"` —
/// a long-standing transcription bug upstream, preserved verbatim here
/// pending upstream confirmation (see DESIGN.md).
fn normalize_po(data: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for (k, v) in data.iter() {
        let fidor = v
            .get("is_trade_by_fidor_reservation_allowed")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .parse::<i64>()
            .unwrap_or(0);
        let sepa = v
            .get("u'is_trade_by_sepa_allowed")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .parse::<i64>()
            .unwrap_or(0);
        out.insert(k.clone(), Value::from(fidor + sepa * 2));
    }
    Value::Object(out)
}

fn value_as_id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn get_str<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("")
}

fn get_f64(data: &Value, key: &str) -> f64 {
    data.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| data.get(key).and_then(Value::as_f64))
        .unwrap_or(0.0)
}

fn get_int_str(data: &Value, key: &str) -> i64 {
    data.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| data.get(key).and_then(Value::as_i64))
        .unwrap_or(0)
}

fn get_i64(data: &Value, key: &str) -> i64 {
    match data.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn scale_cents(data: &Value, key: &str) -> i64 {
    let raw = get_str(data, key);
    raw.parse::<f64>().map(|v| (v * 100.0).round() as i64).unwrap_or(0)
}

fn trust_level(level: &str) -> i64 {
    match level {
        "bronze" => 1,
        "silver" => 2,
        "gold" => 3,
        "platinum" => 4,
        _ => 0,
    }
}

/// The `add_order` normalization schema: every output field is always
/// present; missing source fields become zero/empty after the transform.
fn normalize_add(data: &Value) -> Value {
    let mut out = Map::new();
    out.insert("id".into(), Value::from(get_i64(data, "id")));
    out.insert("uid".into(), Value::from(get_str(data, "uid")));
    out.insert("order_id".into(), Value::from(get_str(data, "order_id")));
    out.insert("price".into(), Value::from(scale_cents(data, "price")));
    out.insert("volume".into(), Value::from(scale_cents(data, "volume")));
    out.insert("amount".into(), Value::from(get_f64(data, "amount")));
    out.insert("min_amount".into(), Value::from(get_f64(data, "min_amount")));
    out.insert("trading_pair".into(), Value::from(get_str(data, "trading_pair")));
    out.insert("order_type".into(), Value::from(get_str(data, "order_type")));
    out.insert("order".into(), Value::from(get_str(data, "order")));
    out.insert("bic_full".into(), Value::from(get_str(data, "bic_full")));
    out.insert("seat_of_bank_of_creator".into(), Value::from(get_str(data, "seat_of_bank_of_creator")));
    out.insert("trade_to_sepa_country".into(), Value::from(get_str(data, "trade_to_sepa_country")));
    out.insert("only_kyc_full".into(), Value::from(get_int_str(data, "only_kyc_full")));
    out.insert("is_kyc_full".into(), Value::from(get_int_str(data, "is_kyc_full")));
    out.insert("fidor_account".into(), Value::from(get_int_str(data, "fidor_account")));
    out.insert("is_trade_by_sepa_allowed".into(), Value::from(get_int_str(data, "is_trade_by_sepa_allowed")));
    out.insert(
        "is_trade_by_fidor_reservation_allowed".into(),
        Value::from(get_int_str(data, "is_trade_by_fidor_reservation_allowed")),
    );
    out.insert("min_trust_level".into(), Value::from(trust_level(get_str(data, "min_trust_level"))));
    out.insert("po".into(), Value::from(get_int_str(data, "payment_option")));

    let shorting = get_int_str(data, "is_shorting");
    let shorting_allowed = get_int_str(data, "is_shorting_allowed");
    out.insert("short".into(), Value::from(shorting * 2 + shorting_allowed));

    Value::Object(out)
}
