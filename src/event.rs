// src/event.rs

//! The canonical `Event` delivered to sinks, and its MessagePack wire format.

use anyhow::Result;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// A stream-specific fingerprint. `add`/`rm`/`skn`/`spr` fingerprints are the
/// id/uid string as the feed delivered it; `po` fingerprints are the
/// order-dependent integer sum described in `handler::po_fingerprint`.
/// Downstream consumers should tolerate either shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    Int(i64),
    Str(String),
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            EventId::Int(i) => s.serialize_i64(*i),
            EventId::Str(v) => s.serialize_str(v),
        }
    }
}

/// One `(arrival_time, source_id)` observation of an already-known event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub arrival_time: f64,
    pub source_id: u8,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: &'static str,
    pub first_seen_at: f64,
    pub payload: Value,
    pub observations: Vec<Observation>,
}

impl Event {
    pub fn new(event_id: EventId, event_type: &'static str, first_seen_at: f64, payload: Value) -> Self {
        Self { event_id, event_type, first_seen_at, payload, observations: Vec::new() }
    }

    /// Observations sorted by arrival time — the view downstream consumers
    /// and tests should use; the insertion-order vec is the mutation-cheap
    /// storage form.
    pub fn sorted_observations(&self) -> Vec<Observation> {
        let mut obs = self.observations.clone();
        obs.sort_by(|a, b| a.arrival_time.partial_cmp(&b.arrival_time).unwrap());
        obs
    }

    /// Packs `{timestamp, type, id, data}` as a MessagePack map, the wire
    /// format the reference sink writes to its subscribers.
    pub fn pack(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Wire<'a> {
            timestamp: i64,
            #[serde(rename = "type")]
            event_type: &'a str,
            id: &'a EventId,
            data: &'a Value,
        }

        let wire = Wire {
            timestamp: self.first_seen_at as i64,
            event_type: self.event_type,
            id: &self.event_id,
            data: &self.payload,
        };
        Ok(rmp_serde::to_vec_named(&wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct WireOwned {
        timestamp: i64,
        #[serde(rename = "type")]
        event_type: String,
        id: serde_json::Value,
        #[allow(dead_code)]
        data: serde_json::Value,
    }

    #[test]
    fn packs_int_id_event() {
        let ev = Event::new(EventId::Int(-30), "po", 100.0, json!({"10": 1}));
        let packed = ev.pack().unwrap();
        let decoded: WireOwned = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(decoded.timestamp, 100);
        assert_eq!(decoded.event_type, "po");
        assert_eq!(decoded.id, json!(-30));
    }

    #[test]
    fn packs_string_id_event() {
        let ev = Event::new(EventId::Str("42".into()), "add", 100.0, json!({}));
        let packed = ev.pack().unwrap();
        let decoded: WireOwned = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(decoded.id, json!("42"));
    }

    #[test]
    fn sorted_observations_orders_by_arrival_time() {
        let mut ev = Event::new(EventId::Str("1".into()), "rm", 5.0, json!({}));
        ev.observations.push(Observation { arrival_time: 5.2, source_id: 2 });
        ev.observations.push(Observation { arrival_time: 5.0, source_id: 1 });
        let sorted = ev.sorted_observations();
        assert_eq!(sorted[0].source_id, 1);
        assert_eq!(sorted[1].source_id, 2);
    }
}
