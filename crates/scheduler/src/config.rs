use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs of the scheduler. Every field has a default, so partial configurations
/// deserialize fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Capacity of the request queue feeding the transaction loop.
	pub queue_capacity: usize,

	/// Events a status watcher may fall behind before it starts losing them.
	pub status_feed_capacity: usize,

	/// Number of transaction records kept in memory.
	pub history_capacity: usize,

	/// How long the retry loop waits for more triggers before submitting a retry transaction.
	pub retry_merge_window_ms: u64,

	/// Grace period for the background loops to stop before they are aborted.
	pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 100,
			status_feed_capacity: 1024,
			history_capacity: 100,
			retry_merge_window_ms: 5,
			shutdown_timeout_secs: 60,
		}
	}
}

impl SchedulerConfig {
	#[must_use]
	pub const fn retry_merge_window(&self) -> Duration {
		Duration::from_millis(self.retry_merge_window_ms)
	}

	#[must_use]
	pub const fn shutdown_timeout(&self) -> Duration {
		Duration::from_secs(self.shutdown_timeout_secs)
	}
}
