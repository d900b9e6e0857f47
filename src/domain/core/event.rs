use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One row of an aggregate's audit trail.
///
/// Envelopes are written in the same transaction as the aggregate state they
/// describe, so `sequence_number` always equals the aggregate version the
/// event produced. Events emitted by a single command share a
/// `correlation_id`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventEnvelope<E> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
    pub event_type: String,
    pub event_data: E,
    pub correlation_id: Uuid,
    /// gateway, courier, vendor, admin, buyer or system
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl<E: DomainEvent> EventEnvelope<E> {
    pub fn new(aggregate_id: Uuid, sequence_number: i64, event_data: E, correlation_id: Uuid) -> Self {
        let event_type = event_data.event_type().to_owned();
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            sequence_number,
            event_type,
            event_data,
            correlation_id,
            actor: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_actor(self, actor: impl Into<String>) -> Self {
        Self { actor: Some(actor.into()), ..self }
    }
}

/// Events that can be written to the audit trail.
pub trait DomainEvent: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync {
    /// Stable name stored in the `event_type` column.
    fn event_type(&self) -> &'static str;
}
