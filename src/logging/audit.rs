//! Audit event log for reconciliation
//!
//! JSONL stream of the events an operator needs when balances look wrong:
//! cycle summaries, commission failures after a committed accrual, referral
//! graph anomalies, and clock-skew incidents. The reconciliation job and
//! out-of-band tooling consume this file; the engine itself never reads it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// One accrual cycle finished (with its counters)
    CycleCompleted,
    /// Accrual committed but its commission distribution failed
    CommissionFailure,
    /// Referral walk hit an already-visited ancestor
    GraphAnomaly,
    /// Wall clock observed behind a position watermark
    ClockSkew,
}

/// One audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    /// Instance that emitted the event
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    /// Amount as a decimal string, for tooling that cannot parse nanos
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, instance_id: String) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            instance_id,
            track: None,
            position_id: None,
            owner_id: None,
            tx_id: None,
            level: None,
            amount: None,
            detail: None,
        }
    }

    pub fn with_track(mut self, track: String) -> Self {
        self.track = Some(track);
        self
    }

    pub fn with_position(mut self, position_id: String) -> Self {
        self.position_id = Some(position_id);
        self
    }

    pub fn with_owner(mut self, owner_id: i64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_tx(mut self, tx_id: String) -> Self {
        self.tx_id = Some(tx_id);
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_amount(mut self, amount: String) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit logger that writes events to a JSONL file
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Mutex<AuditLoggerInner>>,
    instance_id: String,
}

struct AuditLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    /// Create a logger; without `init_file` it drops events silently
    pub fn new(instance_id: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuditLoggerInner {
                writer: None,
                path: None,
            })),
            instance_id,
        }
    }

    /// Initialize file logging to the specified path
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = BufWriter::new(file);

        let mut inner = self.inner.lock().await;
        inner.writer = Some(writer);
        inner.path = Some(path.clone());

        info!("Audit logging initialized to {}", path.display());
        Ok(())
    }

    /// Log an audit event
    pub async fn log(&self, event: AuditEvent) {
        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;

        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write audit event: {}", e);
            }
            // Flush per event for durability; the stream is low-volume
            if let Err(e) = writer.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }
    }

    pub async fn log_cycle_completed(
        &self,
        track: &str,
        processed: u64,
        skipped: u64,
        failed: u64,
        total_yield: String,
    ) {
        let event = AuditEvent::new(AuditKind::CycleCompleted, self.instance_id.clone())
            .with_track(track.to_string())
            .with_amount(total_yield)
            .with_detail(serde_json::json!({
                "processed": processed,
                "skipped": skipped,
                "failed": failed,
            }));
        self.log(event).await;
    }

    pub async fn log_commission_failure(&self, tx_id: &str, owner_id: i64, reason: &str) {
        let event = AuditEvent::new(AuditKind::CommissionFailure, self.instance_id.clone())
            .with_tx(tx_id.to_string())
            .with_owner(owner_id)
            .with_detail(serde_json::json!({ "reason": reason }));
        self.log(event).await;
    }

    pub async fn log_graph_anomaly(&self, source: i64, revisited: i64, level: u8) {
        let event = AuditEvent::new(AuditKind::GraphAnomaly, self.instance_id.clone())
            .with_owner(source)
            .with_level(level)
            .with_detail(serde_json::json!({ "revisited": revisited }));
        self.log(event).await;
    }

    pub async fn log_clock_skew(&self, position_id: &str, skew_ms: i64) {
        let event = AuditEvent::new(AuditKind::ClockSkew, self.instance_id.clone())
            .with_position(position_id.to_string())
            .with_detail(serde_json::json!({ "skew_ms": skew_ms }));
        self.log(event).await;
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization() {
        let event = AuditEvent::new(AuditKind::GraphAnomaly, "inst-1".to_string())
            .with_owner(42)
            .with_level(3);

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("graph_anomaly"));
        assert!(jsonl.contains("42"));
        assert!(!jsonl.contains("tx_id"));
    }

    #[test]
    fn cycle_event_carries_counters() {
        let event = AuditEvent::new(AuditKind::CycleCompleted, "inst-1".to_string())
            .with_track("uni".to_string())
            .with_detail(serde_json::json!({ "processed": 10, "skipped": 2, "failed": 0 }));

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("cycle_completed"));
        assert!(jsonl.contains("\"processed\":10"));
    }

    #[tokio::test]
    async fn uninitialized_logger_drops_events() {
        let logger = AuditLogger::new("inst-1".to_string());
        // No file: must not panic or error
        logger.log_clock_skew("pos-1", -500).await;
    }
}
