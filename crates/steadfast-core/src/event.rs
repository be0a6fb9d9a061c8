// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events: the input that triggers functions and resumes paused runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Component, CoreError, Result};
use crate::id::{EnvId, EventId};

/// Synthetic event that triggers a child run started by `invoke`.
pub const FN_INVOKED: &str = "steadfast/function.invoked";
/// Synthetic event that triggers a cron run.
pub const SCHEDULED_TIMER: &str = "steadfast/scheduled.timer";

/// An event as sent by a client to the ingest endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Client-supplied idempotency id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl IncomingEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data: match data {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            },
            ..Self::default()
        }
    }
}

/// A durable, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub internal_id: EventId,
    pub env_id: EnvId,
    pub name: String,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub user: Value,
    /// Milliseconds since the epoch.
    pub ts: i64,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Event {
    /// Validate an incoming event and stamp it with an internal id.
    pub fn ingest(
        incoming: IncomingEvent,
        env_id: EnvId,
        source_id: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Result<Self> {
        let name = incoming.name.trim();
        if name.is_empty() {
            return Err(CoreError::validation(
                Component::Api,
                "event name is required",
            ));
        }
        Ok(Self {
            internal_id: EventId::generate_at(received_at),
            env_id,
            name: name.to_string(),
            data: incoming.data,
            user: incoming.user.unwrap_or(Value::Null),
            ts: incoming.ts.unwrap_or_else(|| received_at.timestamp_millis()),
            received_at,
            source_id,
            version: incoming.version,
            id: incoming.id,
        })
    }

    /// A system-generated event.
    pub fn internal(env_id: EnvId, name: &str, data: Value, at: DateTime<Utc>) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            internal_id: EventId::generate_at(at),
            env_id,
            name: name.to_string(),
            data,
            user: Value::Null,
            ts: at.timestamp_millis(),
            received_at: at,
            source_id: None,
            version: None,
            id: None,
        }
    }

    /// The shape exposed to expressions and step targets.
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id.clone().unwrap_or_else(|| self.internal_id.to_string()),
            "name": self.name,
            "data": self.data,
            "user": self.user,
            "ts": self.ts,
            "v": self.version,
        })
    }
}

/// Body accepted by the ingest endpoint: one event or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngestBody {
    Many(Vec<IncomingEvent>),
    One(IncomingEvent),
}

impl IngestBody {
    pub fn into_events(self) -> Vec<IncomingEvent> {
        match self {
            Self::Many(events) => events,
            Self::One(event) => vec![event],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_ingest_defaults_ts() {
        let now = Utc::now();
        let event = Event::ingest(
            IncomingEvent::new("order.paid", json!({"id": "A"})),
            Uuid::nil(),
            None,
            now,
        )
        .unwrap();
        assert_eq!(event.ts, now.timestamp_millis());
        assert_eq!(event.to_value()["data"]["id"], "A");
        assert_eq!(event.internal_id.created_at().timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_ingest_rejects_empty_name() {
        let err = Event::ingest(IncomingEvent::new("  ", Value::Null), Uuid::nil(), None, Utc::now())
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_ingest_body_single_or_many() {
        let one: IngestBody = serde_json::from_value(json!({"name": "a"})).unwrap();
        assert_eq!(one.into_events().len(), 1);
        let many: IngestBody =
            serde_json::from_value(json!([{"name": "a"}, {"name": "b", "ts": 5}])).unwrap();
        let events = many.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].ts, Some(5));
    }
}
