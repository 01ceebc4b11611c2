//! kexp core types: the enriched event model, the sink capability and the
//! shared metrics store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

pub mod metrics;

pub use metrics::MetricsStore;

/// Involved object reference extended with resolved metadata.
///
/// Either mirrors the plain reference (lookup skipped or failed) or carries
/// the full label/annotation/owner set of the live object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedObjectReference {
    #[serde(flatten)]
    pub reference: ObjectReference,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub deleted: bool,
}

impl EnhancedObjectReference {
    /// Plain reference, nothing resolved.
    pub fn plain(reference: &ObjectReference) -> Self {
        Self { reference: reference.clone(), ..Default::default() }
    }

    pub fn api_version(&self) -> &str { opt(&self.reference.api_version) }
    pub fn kind(&self) -> &str { opt(&self.reference.kind) }
    pub fn name(&self) -> &str { opt(&self.reference.name) }
    pub fn namespace(&self) -> &str { opt(&self.reference.namespace) }
}

/// Metadata resolved for an involved object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub deleted: bool,
}

impl ObjectMetadata {
    /// Populate a reference from resolved metadata; plain fields are kept.
    pub fn enrich(&self, reference: &ObjectReference) -> EnhancedObjectReference {
        EnhancedObjectReference {
            reference: reference.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            owner_references: self.owner_references.clone(),
            deleted: self.deleted,
        }
    }
}

/// A cluster event after filtering and enrichment.
///
/// Built once by the watcher; the engine shares it behind an `Arc` and never
/// mutates it afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedEvent {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub involved_object: EnhancedObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

impl EnhancedEvent {
    /// Working copy of a raw event with managed fields stripped.
    pub fn from_event(ev: &Event, involved_object: EnhancedObjectReference) -> Self {
        let mut metadata = ev.metadata.clone();
        metadata.managed_fields = None;
        Self {
            metadata,
            reason: ev.reason.clone(),
            message: ev.message.clone(),
            type_: ev.type_.clone(),
            count: ev.count,
            source: ev.source.clone(),
            first_timestamp: ev.first_timestamp.as_ref().map(|t| t.0),
            last_timestamp: ev.last_timestamp.as_ref().map(|t| t.0),
            event_time: ev.event_time.as_ref().map(|t| t.0),
            reporting_component: ev.reporting_component.clone(),
            reporting_instance: ev.reporting_instance.clone(),
            action: ev.action.clone(),
            involved_object,
            cluster_name: None,
        }
    }

    pub fn uid(&self) -> &str { opt(&self.metadata.uid) }
    pub fn name(&self) -> &str { opt(&self.metadata.name) }
    pub fn namespace(&self) -> &str { opt(&self.metadata.namespace) }
    pub fn reason(&self) -> &str { opt(&self.reason) }
    pub fn message(&self) -> &str { opt(&self.message) }
    pub fn type_(&self) -> &str { opt(&self.type_) }

    pub fn component(&self) -> &str {
        self.source.as_ref().map(|s| opt(&s.component)).unwrap_or("")
    }

    pub fn host(&self) -> &str {
        self.source.as_ref().map(|s| opt(&s.host)).unwrap_or("")
    }

    /// Serialized JSON form used by line-oriented sinks.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn opt(v: &Option<String>) -> &str { v.as_deref().unwrap_or("") }

// ---- sink capability ----

/// Errors a sink reports for a single send.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("sink closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Destination capability: accept an event for delivery, release resources on close.
///
/// `close` is called exactly once per registration, after the last `send`.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, event: &EnhancedEvent) -> Result<(), SinkError>;
    async fn close(&self);
}

pub mod prelude {
    pub use super::{EnhancedEvent, EnhancedObjectReference, MetricsStore, ObjectMetadata, Sink, SinkError};
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, Time};

    fn raw_event() -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some("pod-a.17a".into()),
                namespace: Some("default".into()),
                uid: Some("0d3a1f5e-0000-0000-0000-000000000001".into()),
                managed_fields: Some(vec![ManagedFieldsEntry::default()]),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".into()),
                kind: Some("Pod".into()),
                name: Some("pod-a".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            reason: Some("BackOff".into()),
            message: Some("Back-off restarting failed container".into()),
            type_: Some("Warning".into()),
            last_timestamp: Some(Time(DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc))),
            ..Default::default()
        }
    }

    #[test]
    fn from_event_strips_managed_fields() {
        let raw = raw_event();
        let ev = EnhancedEvent::from_event(&raw, EnhancedObjectReference::plain(&raw.involved_object));
        assert!(ev.metadata.managed_fields.is_none());
        assert_eq!(ev.reason(), "BackOff");
        assert_eq!(ev.involved_object.kind(), "Pod");
        assert!(ev.last_timestamp.is_some());
        assert!(raw.metadata.managed_fields.is_some());
    }

    #[test]
    fn json_uses_camel_case_and_flattens_reference() {
        let raw = raw_event();
        let mut md = ObjectMetadata::default();
        md.labels.insert("app".into(), "web".into());
        let ev = EnhancedEvent::from_event(&raw, md.enrich(&raw.involved_object));
        let v: serde_json::Value = serde_json::from_slice(&ev.to_json().unwrap()).unwrap();
        assert_eq!(v["involvedObject"]["kind"], "Pod");
        assert_eq!(v["involvedObject"]["labels"]["app"], "web");
        assert_eq!(v["involvedObject"]["deleted"], false);
        assert_eq!(v["type"], "Warning");
        assert!(v.get("clusterName").is_none());
        assert!(v.get("lastTimestamp").is_some());
    }

    #[test]
    fn accessors_default_to_empty() {
        let ev = EnhancedEvent::default();
        assert_eq!(ev.namespace(), "");
        assert_eq!(ev.component(), "");
        assert_eq!(ev.involved_object.api_version(), "");
    }
}
