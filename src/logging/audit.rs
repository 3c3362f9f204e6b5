//! Audit log for grants and approvals
//!
//! Appends one JSON object per line. Disabled until a file is attached with
//! [`AuditLogger::init_file`]; events logged before that are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Audit event types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Session unlocked
    Unlocked,
    /// Session locked
    Locked,
    /// Origin granted a connection
    ConnectionGranted,
    /// Origin disconnected
    ConnectionRevoked,
    /// Request taken from the queue for execution
    Approved,
    /// Request declined by the user
    Rejected,
    /// Approved request settled
    Settled,
    /// Approved request failed after leaving the queue
    Failed,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            origin: None,
            request_id: None,
            detail: None,
        }
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
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

/// Writes audit events to a JSONL file
#[derive(Clone, Default)]
pub struct AuditLogger {
    inner: Arc<Mutex<AuditLoggerInner>>,
}

#[derive(Default)]
struct AuditLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    /// Logger with no file attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to `path`, creating it if needed
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = self.inner.lock().await;
        inner.writer = Some(BufWriter::new(file));
        inner.path = Some(path.clone());

        info!("Audit logging initialized to {}", path.display());
        Ok(())
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.inner.lock().await.path.clone()
    }

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
            if let Err(e) = writer.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }
    }

    pub async fn log_grant(&self, origin: &str) {
        self.log(AuditEvent::new(AuditEventType::ConnectionGranted).with_origin(origin))
            .await;
    }

    pub async fn log_revoke(&self, origin: &str) {
        self.log(AuditEvent::new(AuditEventType::ConnectionRevoked).with_origin(origin))
            .await;
    }

    /// Log a decision or outcome for a queued request
    pub async fn log_request(&self, event_type: AuditEventType, origin: &str, request_id: &str) {
        self.log(
            AuditEvent::new(event_type)
                .with_origin(origin)
                .with_request(request_id),
        )
        .await;
    }

    pub async fn log_failure(&self, origin: &str, request_id: &str, reason: &str) {
        self.log(
            AuditEvent::new(AuditEventType::Failed)
                .with_origin(origin)
                .with_request(request_id)
                .with_detail(serde_json::json!({ "reason": reason })),
        )
        .await;
    }
}
