//! Audit sink seam.
//!
//! The engine reports every decision to an [`AuditSink`] and never blocks on
//! it; persistence and signing of audit trails are an external concern.

use serde::Serialize;
use tracing::info;

/// One structured audit entry.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditRecord {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl AuditRecord {
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }
}

/// Fire-and-forget audit logging.
pub trait AuditSink: Send + Sync {
    fn log(&self, record: AuditRecord);
}

/// Default sink: emits the record as a structured tracing event on the
/// `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, record: AuditRecord) {
        info!(
            target: "audit",
            action = %record.action,
            user = record.user.as_deref().unwrap_or(""),
            realm = record.realm.as_deref().unwrap_or(""),
            serial = record.serial.as_deref().unwrap_or(""),
            token_type = record.token_type.as_deref().unwrap_or(""),
            client = record.client.as_deref().unwrap_or(""),
            success = record.success,
            info = record.info.as_deref().unwrap_or(""),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink capturing records, used across the engine tests.
    #[derive(Debug, Default)]
    pub(crate) struct CapturingSink {
        pub records: Mutex<Vec<AuditRecord>>,
    }

    impl AuditSink for CapturingSink {
        fn log(&self, record: AuditRecord) {
            if let Ok(mut records) = self.records.lock() {
                records.push(record);
            }
        }
    }

    #[test]
    fn records_serialize_without_empty_fields() {
        let record = AuditRecord {
            success: true,
            ..AuditRecord::new("validate_check")
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["action"], "validate_check");
        assert!(json.get("serial").is_none());
    }

    #[test]
    fn capturing_sink_collects() {
        let sink = CapturingSink::default();
        sink.log(AuditRecord::new("validate_check"));
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }
}
