//! scanfleet-monitor — polls the scan manager's queue and feeds the
//! orchestrator.
//!
//! One periodic loop, communicating with the engine manager exclusively
//! through two bounded queues: newly observed pending scans (classified
//! by tier) and completions of previously assigned scan runs. Enqueueing
//! blocks under backpressure rather than dropping work.

pub mod monitor;

pub use monitor::ScanQueueMonitor;
