//! One handler invocation and its piggyback queue.

use crate::domain::envelope::WireEnvelope;
use parking_lot::Mutex;
use serde_json::Value;

/// What a handler sees of the inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRecord {
    pub name: String,
    /// Client ts corrected by the connection's clock offset.
    pub ts: i64,
    /// Client ts as sent; responses echo this.
    pub wire_ts: i64,
    pub params: Value,
}

impl InvocationRecord {
    pub fn from_envelope(envelope: &WireEnvelope, ms_offset: i64) -> Self {
        Self {
            name: envelope.name().to_string(),
            ts: envelope.ts().saturating_add(ms_offset),
            wire_ts: envelope.ts(),
            params: envelope.data().clone(),
        }
    }
}

/// Per-invocation state: the record plus events queued to ride along with
/// the response.
#[derive(Debug)]
pub struct Invocation {
    record: InvocationRecord,
    piggyback: Mutex<Vec<WireEnvelope>>,
}

impl Invocation {
    pub fn new(record: InvocationRecord) -> Self {
        Self {
            record,
            piggyback: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self) -> &InvocationRecord {
        &self.record
    }

    /// Queue an event for the response batch.
    pub fn queue_event(&self, envelope: WireEnvelope) {
        self.piggyback.lock().push(envelope);
    }

    /// Take the queued events, leaving the queue empty.
    pub fn take_events(&self) -> Vec<WireEnvelope> {
        std::mem::take(&mut *self.piggyback.lock())
    }

    pub fn queued_len(&self) -> usize {
        self.piggyback.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_applies_offset() {
        let envelope = WireEnvelope::request("ping", 1000, json!({"x": 1}));
        let record = InvocationRecord::from_envelope(&envelope, -250);
        assert_eq!(record.ts, 750);
        assert_eq!(record.wire_ts, 1000);
        assert_eq!(record.params["x"], 1);
    }

    #[test]
    fn test_take_events_drains() {
        let invocation = Invocation::new(InvocationRecord::from_envelope(
            &WireEnvelope::request("a", 1, Value::Null),
            0,
        ));
        invocation.queue_event(WireEnvelope::event("e", 2, Value::Null));
        assert_eq!(invocation.queued_len(), 1);
        assert_eq!(invocation.take_events().len(), 1);
        assert_eq!(invocation.queued_len(), 0);
    }
}
