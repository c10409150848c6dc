use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Classification of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Unknown,
    Observation,
    Alert,
}

/// Action recorded on an event: the one the rule recommends, and the one
/// finally taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Unknown,
    Log,
    Block,
    Ignore,
    Allow,
}

/// LogEvent is one structured event emitted by a rule action and buffered
/// on the transaction. Tags are shared with the emitting rule and stay
/// valid for the rule's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub rule_id: String,
    pub kind: EventKind,
    pub rec_action: EventAction,
    pub action: EventAction,
    /// In `[0, 100]`.
    pub confidence: u8,
    /// In `[0, 100]`.
    pub severity: u8,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "data_as_base64")]
    pub data: Option<Bytes>,
    #[serde(skip_serializing_if = "tags_is_empty", serialize_with = "tags_as_seq")]
    pub tags: Arc<[String]>,
}

fn data_as_base64<S>(data: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match data {
        Some(data) => serializer.serialize_str(&base64::encode(data)),
        None => serializer.serialize_none(),
    }
}

fn tags_is_empty(tags: &Arc<[String]>) -> bool {
    tags.is_empty()
}

fn tags_as_seq<S>(tags: &Arc<[String]>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(tags.iter())
}

#[cfg(test)]
mod test {
    use super::{EventAction, EventKind, LogEvent};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_serialization() {
        let event = LogEvent {
            rule_id: "rule-7".to_string(),
            kind: EventKind::Observation,
            rec_action: EventAction::Unknown,
            action: EventAction::Unknown,
            confidence: 80,
            severity: 40,
            msg: "saw something".to_string(),
            data: Some(bytes::Bytes::from_static(b"evidence")),
            tags: vec!["sqli".to_string(), "t/2".to_string()].into(),
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "rule_id": "rule-7",
                "kind": "observation",
                "rec_action": "unknown",
                "action": "unknown",
                "confidence": 80,
                "severity": 40,
                "msg": "saw something",
                "data": "ZXZpZGVuY2U=",
                "tags": ["sqli", "t/2"],
            })
        );
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let event = LogEvent {
            rule_id: "r".to_string(),
            kind: EventKind::Observation,
            rec_action: EventAction::Unknown,
            action: EventAction::Unknown,
            confidence: 0,
            severity: 0,
            msg: String::new(),
            data: None,
            tags: Vec::new().into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("data").is_none());
        assert!(value.get("tags").is_none());
    }
}
