//! Scan queue types exchanged between the queue monitor and the engine
//! manager.

use serde::{Deserialize, Serialize};

/// A pending scan as reported by the scan manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Scan identifier in the scan manager's queue.
    pub id: String,
    /// Identifier of the concrete scan run an engine executes.
    pub run_id: String,
    /// Estimated lines of code. May be negative when the manager could
    /// not size the project; classification rejects such values.
    pub loc: i64,
    /// Epoch seconds when the scan was submitted.
    pub submitted_at: u64,
    /// Project name, for operator-facing logs.
    pub project: Option<String>,
}

/// A pending scan paired with its classified capacity tier, awaiting
/// engine assignment. Produced by the queue monitor, consumed exactly
/// once by the engine manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedScan {
    pub tier: String,
    pub request: ScanRequest,
}

/// Notification that a previously assigned scan run has finished and its
/// engine can return to idle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCompletion {
    pub engine_name: String,
    pub scan_run_id: String,
}
