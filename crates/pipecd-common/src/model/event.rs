use super::{hash_id, impl_entity, require};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    #[default]
    EventNotHandled,
    EventSuccess,
    EventFailure,
    EventOutdated,
}

/// Notification registered by an external system
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub data: String,
    pub project_id: String,
    pub labels: BTreeMap<String, String>,
    /// Hash of name + labels, shared by events of the same stream
    pub event_key: String,
    pub status: EventStatus,
    pub status_description: String,
    pub handled_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Event {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.name, "name")?;
        require(&self.project_id, "projectId")
    }

    /// Key identifying the stream an event belongs to
    pub fn make_event_key(name: &str, labels: &BTreeMap<String, String>) -> String {
        let mut parts = vec![name.to_string()];
        parts.extend(labels.iter().map(|(k, v)| format!("{k}:{v}")));
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        hash_id(&refs)
    }

    /// Deterministic id from name, project and event key
    pub fn make_id(name: &str, project_id: &str, event_key: &str, created_at: i64) -> String {
        hash_id(&[name, project_id, event_key, &created_at.to_string()])
    }
}

impl_entity!(Event, "Event");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_ignores_label_insert_order() {
        let mut a = BTreeMap::new();
        a.insert("env".to_string(), "prod".to_string());
        a.insert("app".to_string(), "web".to_string());
        let mut b = BTreeMap::new();
        b.insert("app".to_string(), "web".to_string());
        b.insert("env".to_string(), "prod".to_string());
        assert_eq!(Event::make_event_key("image", &a), Event::make_event_key("image", &b));
        assert_ne!(Event::make_event_key("image", &a), Event::make_event_key("helm", &a));
    }
}
