//! Trigger event decoding
//!
//! The controller is invoked with one of four trigger kinds: an object-store
//! change, a VM state-change notification, a delayed requeue message, or a
//! direct invocation naming the cluster. Raw payloads are JSON; both the
//! native notification shapes and a flattened form are accepted.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// One decoded trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    /// A cluster document changed under `clusters/<name>/...`
    ObjectStoreChange { bucket: String, key: String },

    /// A VM changed state; the cluster is found via its tags
    ComputeStateChange {
        instance_id: String,
        new_state: String,
    },

    /// A delayed requeue message came due
    Requeue {
        cluster_name: String,
        scheduled_for: Option<DateTime<Utc>>,
    },

    /// Direct invocation for one cluster
    Direct { cluster_name: String },
}

impl TriggerEvent {
    /// Decode a raw JSON payload into a trigger
    pub fn decode(payload: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(payload).context("trigger payload is not valid JSON")?;

        // Native S3 notification: {"Records": [{"s3": {...}}]}
        if let Some(records) = value.get("Records").and_then(Value::as_array) {
            let record = records
                .first()
                .ok_or_else(|| anyhow!("notification has no records"))?;
            let s3 = record
                .get("s3")
                .ok_or_else(|| anyhow!("record carries no s3 section"))?;
            let bucket = s3
                .pointer("/bucket/name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("record has no bucket name"))?;
            let key = s3
                .pointer("/object/key")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("record has no object key"))?;
            return Ok(TriggerEvent::ObjectStoreChange {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        // EventBridge EC2 state-change notification
        if value.get("detail-type").and_then(Value::as_str)
            == Some("EC2 Instance State-change Notification")
        {
            let instance_id = value
                .pointer("/detail/instance-id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("state-change event has no instance id"))?;
            let new_state = value
                .pointer("/detail/state")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Ok(TriggerEvent::ComputeStateChange {
                instance_id: instance_id.to_string(),
                new_state: new_state.to_string(),
            });
        }

        // Flattened forms
        if let (Some(bucket), Some(key)) = (
            value.get("bucket").and_then(Value::as_str),
            value.get("key").and_then(Value::as_str),
        ) {
            return Ok(TriggerEvent::ObjectStoreChange {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if let Some(instance_id) = value.get("instanceId").and_then(Value::as_str) {
            return Ok(TriggerEvent::ComputeStateChange {
                instance_id: instance_id.to_string(),
                new_state: value
                    .get("newState")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if let Some(cluster_name) = value.get("clusterName").and_then(Value::as_str) {
            let scheduled_for = value
                .get("scheduledFor")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            if value.get("scheduledFor").is_some() {
                return Ok(TriggerEvent::Requeue {
                    cluster_name: cluster_name.to_string(),
                    scheduled_for,
                });
            }
            return Ok(TriggerEvent::Direct {
                cluster_name: cluster_name.to_string(),
            });
        }

        bail!("unrecognized trigger payload")
    }
}

/// Extract the cluster name from a document key: `clusters/<name>/...`
pub fn cluster_name_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("clusters/")?;
    let name = rest.split('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_native_s3_notification() {
        let payload = r#"{
            "Records": [
                {"s3": {"bucket": {"name": "k3man"}, "object": {"key": "clusters/demo/config"}}}
            ]
        }"#;
        let event = TriggerEvent::decode(payload).unwrap();
        assert_eq!(
            event,
            TriggerEvent::ObjectStoreChange {
                bucket: "k3man".to_string(),
                key: "clusters/demo/config".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_flat_object_store_change() {
        let event =
            TriggerEvent::decode(r#"{"bucket": "k3man", "key": "clusters/demo/status"}"#).unwrap();
        assert!(matches!(event, TriggerEvent::ObjectStoreChange { .. }));
    }

    #[test]
    fn test_decode_eventbridge_state_change() {
        let payload = r#"{
            "detail-type": "EC2 Instance State-change Notification",
            "detail": {"instance-id": "i-0abc", "state": "stopped"}
        }"#;
        let event = TriggerEvent::decode(payload).unwrap();
        assert_eq!(
            event,
            TriggerEvent::ComputeStateChange {
                instance_id: "i-0abc".to_string(),
                new_state: "stopped".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_requeue_and_direct() {
        let requeue = TriggerEvent::decode(
            r#"{"clusterName": "demo", "scheduledFor": "2026-08-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            requeue,
            TriggerEvent::Requeue { ref cluster_name, scheduled_for: Some(_) }
                if cluster_name == "demo"
        ));

        let direct = TriggerEvent::decode(r#"{"clusterName": "demo"}"#).unwrap();
        assert_eq!(
            direct,
            TriggerEvent::Direct {
                cluster_name: "demo".to_string()
            }
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(TriggerEvent::decode("not json").is_err());
        assert!(TriggerEvent::decode(r#"{"something": "else"}"#).is_err());
    }

    #[test]
    fn test_cluster_name_from_key() {
        assert_eq!(
            cluster_name_from_key("clusters/demo/config"),
            Some("demo")
        );
        assert_eq!(cluster_name_from_key("clusters/demo"), Some("demo"));
        assert_eq!(cluster_name_from_key("clusters//config"), None);
        assert_eq!(cluster_name_from_key("other/demo/config"), None);
    }
}
