//! Call detail record lifecycle
//!
//! One record per call: opened when routing succeeds, closed when the
//! call ends. Persistence is best-effort; a failed store write costs the
//! record, never the call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::store::{CallRecord, PbxStore};

/// Final disposition of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    InProgress,
    Completed,
    NoAnswer,
    Voicemail,
    Cancelled,
    Failed,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Voicemail => "voicemail",
            CallStatus::Cancelled => "cancelled",
            CallStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks open call records and persists them through the store
pub struct CdrSystem {
    store: Option<Arc<dyn PbxStore>>,
    open: Mutex<HashMap<String, CallRecord>>,
}

impl CdrSystem {
    pub fn new(store: Option<Arc<dyn PbxStore>>) -> Self {
        CdrSystem {
            store,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Open a record for a newly-routed call.
    pub async fn start_record(&self, call_id: &str, from_extension: &str, to_extension: &str) {
        let record = CallRecord {
            call_id: call_id.to_string(),
            from_extension: from_extension.to_string(),
            to_extension: to_extension.to_string(),
            start: Utc::now(),
            end: None,
            duration_seconds: None,
            status: CallStatus::InProgress.to_string(),
            recording_path: None,
        };

        self.open.lock().insert(call_id.to_string(), record.clone());

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_call_record(record).await {
                warn!(call_id, error = %e, "CDR open not persisted; call continues");
            }
        }
    }

    /// Close a call's record with its final status.
    ///
    /// Returns the finished record (also kept nowhere else in memory, so
    /// callers wanting it must take it here).
    pub async fn end_record(
        &self,
        call_id: &str,
        status: CallStatus,
        recording_path: Option<String>,
    ) -> Option<CallRecord> {
        let mut record = self.open.lock().remove(call_id)?;

        let end = Utc::now();
        let duration = (end - record.start).num_seconds();
        record.end = Some(end);
        record.duration_seconds = Some(duration);
        record.status = status.to_string();
        record.recording_path = recording_path.clone();

        if let Some(store) = &self.store {
            if let Err(e) = store
                .close_call_record(call_id, end, duration, &status.to_string(), recording_path)
                .await
            {
                warn!(call_id, error = %e, "CDR close not persisted");
            } else {
                debug!(call_id, %status, duration, "CDR closed");
            }
        }

        Some(record)
    }

    /// Number of records still open (active calls).
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}
