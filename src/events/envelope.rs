use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::flags::{FlagDecision, Properties};

const LIB: &str = "posthog-rust";
const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An event to be sent, before it is accepted for delivery.
///
/// Use [`Event::new`] for custom events, or one of the constructors for the special events
/// understood by the server ([`Event::identify`], [`Event::alias`], [`Event::group_identify`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event: String,
    distinct_id: String,
    properties: Properties,
    groups: HashMap<String, String>,
    timestamp: Option<DateTime<Utc>>,
    uuid: Option<Uuid>,
}

impl Event {
    /// Create an event named `event` performed by `distinct_id`.
    pub fn new(event: impl Into<String>, distinct_id: impl Into<String>) -> Event {
        Event {
            event: event.into(),
            distinct_id: distinct_id.into(),
            properties: Properties::new(),
            groups: HashMap::new(),
            timestamp: None,
            uuid: None,
        }
    }

    /// Set person properties for `distinct_id`.
    pub fn identify(distinct_id: impl Into<String>, set: Properties) -> Event {
        Event::new("$identify", distinct_id).with_property("$set", to_object(set))
    }

    /// Link `alias` to the person known as `distinct_id`.
    pub fn alias(distinct_id: impl Into<String>, alias: impl Into<String>) -> Event {
        let distinct_id = distinct_id.into();
        Event::new("$create_alias", distinct_id.clone())
            .with_property("distinct_id", distinct_id)
            .with_property("alias", alias.into())
    }

    /// Set properties of the group `group_key` of type `group_type`.
    ///
    /// The event is attributed to `${group_type}_{group_key}`; use [`Event::with_distinct_id`] to
    /// attribute it to a person instead.
    pub fn group_identify(
        group_type: impl Into<String>,
        group_key: impl Into<String>,
        properties: Properties,
    ) -> Event {
        let group_type = group_type.into();
        let group_key = group_key.into();
        Event::new("$groupidentify", format!("${group_type}_{group_key}"))
            .with_property("$group_type", group_type)
            .with_property("$group_key", group_key)
            .with_property("$group_set", to_object(properties))
    }

    /// `$feature_flag_called` telemetry for a decision served to `distinct_id`.
    pub(crate) fn feature_flag_called(
        distinct_id: &str,
        decision: &FlagDecision,
        groups: &HashMap<String, String>,
    ) -> Event {
        let response = serde_json::to_value(&decision.value).unwrap_or_default();
        let mut event = Event::new("$feature_flag_called", distinct_id)
            .with_property("$feature_flag", decision.key.as_str())
            .with_property("$feature_flag_response", response.clone())
            .with_property(format!("$feature/{}", decision.key), response)
            .with_property("locally_evaluated", decision.is_locally_evaluated())
            .with_property("$feature_flag_reason", decision.reason.describe());
        if let Some(payload) = &decision.payload {
            event = event.with_property("$feature_flag_payload", payload.clone());
        }
        event.groups = groups.clone();
        event
    }

    /// `$exception` event describing `error` and its chain of sources.
    pub(crate) fn exception(
        distinct_id: &str,
        error: &(dyn std::error::Error + 'static),
    ) -> Event {
        let mut chain = Vec::new();
        let mut current = Some(error);
        while let Some(err) = current {
            chain.push(serde_json::json!({
                "type": "Error",
                "value": err.to_string(),
                "mechanism": {"type": "generic", "handled": true},
            }));
            current = err.source();
        }
        Event::new("$exception", distinct_id)
            .with_property("$exception_message", error.to_string())
            .with_property("$exception_list", chain)
    }

    /// Set a single property.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Event {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Merge `properties` into the event's properties.
    pub fn with_properties(mut self, properties: Properties) -> Event {
        self.properties.extend(properties);
        self
    }

    /// Set `key` unless the event already has it.
    pub(crate) fn with_default_property(mut self, key: &str, value: &serde_json::Value) -> Event {
        if !self.properties.contains_key(key) {
            self.properties.insert(key.to_owned(), value.clone());
        }
        self
    }

    /// Associate the event with a group.
    pub fn with_group(mut self, group_type: impl Into<String>, group_key: impl Into<String>) -> Event {
        self.groups.insert(group_type.into(), group_key.into());
        self
    }

    /// Override who the event is attributed to.
    pub fn with_distinct_id(mut self, distinct_id: impl Into<String>) -> Event {
        self.distinct_id = distinct_id.into();
        self
    }

    /// Use `timestamp` instead of the time the event is enqueued.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Event {
        self.timestamp = Some(timestamp);
        self
    }

    /// Use `uuid` instead of a generated message id. Lets the server deduplicate resends.
    pub fn with_uuid(mut self, uuid: Uuid) -> Event {
        self.uuid = Some(uuid);
        self
    }

    /// Event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Subject of the event.
    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    /// Seal the event for delivery: assign its id and timestamp and add library properties.
    pub(crate) fn into_envelope(self) -> Envelope {
        let mut properties = self.properties;
        if !self.groups.is_empty() {
            properties.insert(
                "$groups".to_owned(),
                serde_json::to_value(self.groups).unwrap_or_default(),
            );
        }
        properties.insert("$lib".to_owned(), LIB.into());
        properties.insert("$lib_version".to_owned(), LIB_VERSION.into());

        Envelope {
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            event: self.event,
            distinct_id: self.distinct_id,
            properties,
        }
    }
}

fn to_object(properties: Properties) -> serde_json::Value {
    serde_json::Value::Object(properties.into_iter().collect())
}

/// An event accepted for delivery. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    uuid: Uuid,
    timestamp: DateTime<Utc>,
    event: String,
    distinct_id: String,
    properties: Properties,
}

impl Envelope {
    /// Message id, unique per envelope.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[allow(missing_docs)]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[allow(missing_docs)]
    pub fn event(&self) -> &str {
        &self.event
    }

    #[allow(missing_docs)]
    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    #[allow(missing_docs)]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Size of the envelope once serialized.
    pub(crate) fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }
}
