//! Append-only audit trail. One record per rewrap or peer-unwrap request.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};

pub const AUDIT_TARGET: &str = "kas::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditDecision {
    Permit,
    Deny,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub kas_id: String,
    /// `peer-unwrap` for calls arriving from another KAS.
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub decision: AuditDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Internal reason. Never returned to the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub kao_ids: Vec<String>,
    pub kas_contacted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(default)]
    pub amr: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Writes each record as a JSON line on the `kas::audit` log target.
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => info!(target: AUDIT_TARGET, "{}", line),
            Err(e) => error!(
                target: AUDIT_TARGET,
                "failed to serialize audit record {}: {}", record.request_id, e
            ),
        }
    }
}

/// Keeps records in memory; used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(decision: AuditDecision) -> AuditRecord {
        AuditRecord {
            request_id: "req-1".to_string(),
            timestamp: Utc::now(),
            kas_id: "kas-usa".to_string(),
            operation: "rewrap".to_string(),
            subject: Some("john.doe@mil".to_string()),
            decision,
            error_code: None,
            reason: None,
            kao_ids: vec!["kao-1".to_string()],
            kas_contacted: vec![],
            acr: Some("2".to_string()),
            amr: vec!["pwd".to_string(), "otp".to_string()],
            source_ip: None,
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        sink.record(record(AuditDecision::Permit)).await;
        sink.record(record(AuditDecision::Deny)).await;

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].decision, AuditDecision::Deny);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(record(AuditDecision::Permit)).unwrap();
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["decision"], "Permit");
        assert_eq!(json["kaoIds"][0], "kao-1");
        assert!(json.get("errorCode").is_none());
    }

    #[test]
    fn test_timestamp_round_trips_as_rfc3339() {
        let original = record(AuditDecision::Error);
        let json = serde_json::to_value(&original).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(json["timestamp"].as_str().unwrap()).is_ok());

        let parsed: AuditRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.timestamp, original.timestamp);
    }
}
