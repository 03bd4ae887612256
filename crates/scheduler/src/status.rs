//! Status feed
//!
//! Every key processed by a transaction produces exactly one [`KeyOutcome`]. Outcomes are
//! returned in the [`TxnReport`](crate::TxnReport) and also broadcast to watchers, which may
//! filter them by key.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::{
	error::KeyError,
	value::{Key, KeySelector},
};

/// Outcome of one key within one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "details", rename_all = "snake_case")]
pub enum ValueStatus {
	/// Created.
	Applied,
	/// Modified in place, or recreated.
	Updated,
	Deleted,
	/// Nothing to do, the applied value is already equivalent.
	Skipped,
	Failed(KeyError),
	/// Parked until the listed dependencies (`label:key`) are applied.
	Pending(Vec<String>),
}

impl ValueStatus {
	#[must_use]
	pub const fn is_failed(&self) -> bool {
		matches!(self, Self::Failed(_))
	}

	#[must_use]
	pub const fn is_pending(&self) -> bool {
		matches!(self, Self::Pending(_))
	}
}

impl fmt::Display for ValueStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Applied => write!(f, "applied"),
			Self::Updated => write!(f, "updated"),
			Self::Deleted => write!(f, "deleted"),
			Self::Skipped => write!(f, "skipped"),
			Self::Failed(e) => write!(f, "failed: {e}"),
			Self::Pending(unmet) => write!(f, "pending on [{}]", unmet.join(", ")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutcome {
	pub key: Key,
	/// Parent key, for derived values.
	pub derived_from: Option<Key>,
	pub status: ValueStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
	pub txn_seq: u64,
	#[serde(flatten)]
	pub outcome: KeyOutcome,
}

/// Broadcasts status events to every watcher.
#[derive(Debug, Clone)]
pub(crate) struct StatusFeed {
	sender: broadcast::Sender<StatusEvent>,
}

impl StatusFeed {
	pub(crate) fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		debug!("Created status feed with capacity {capacity}");
		Self { sender }
	}

	/// Returns the number of watchers that received the event.
	pub(crate) fn emit(&self, event: StatusEvent) -> usize {
		let key = event.outcome.key.clone();

		match self.sender.send(event) {
			Ok(count) => {
				trace!(%key, subscribers = count, "Status event emitted");
				count
			}
			Err(_) => {
				// no watchers
				0
			}
		}
	}

	pub(crate) fn watch(&self, selector: Option<KeySelector>) -> StatusWatcher {
		StatusWatcher {
			receiver: self.sender.subscribe(),
			selector,
		}
	}

	pub(crate) fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

/// Receives status events, optionally restricted to keys passing a selector.
pub struct StatusWatcher {
	receiver: broadcast::Receiver<StatusEvent>,
	selector: Option<KeySelector>,
}

impl StatusWatcher {
	/// Next matching event, `None` once the scheduler is gone.
	///
	/// Events missed because this watcher fell behind are logged and skipped.
	pub async fn next(&mut self) -> Option<StatusEvent> {
		loop {
			match self.receiver.recv().await {
				Ok(event) => {
					if self
						.selector
						.as_ref()
						.map_or(true, |selector| selector(&event.outcome.key))
					{
						return Some(event);
					}
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(skipped, "Status watcher lagged behind, events were dropped");
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

impl fmt::Debug for StatusWatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StatusWatcher")
			.field("filtered", &self.selector.is_some())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	fn event(seq: u64, key: &str) -> StatusEvent {
		StatusEvent {
			txn_seq: seq,
			outcome: KeyOutcome {
				key: key.to_string(),
				derived_from: None,
				status: ValueStatus::Applied,
			},
		}
	}

	#[tokio::test]
	async fn test_watch_filters_keys() {
		let feed = StatusFeed::new(16);
		let mut all = feed.watch(None);
		let mut interfaces = feed.watch(Some(Arc::new(|key: &str| key.starts_with("if/"))));

		assert_eq!(feed.subscriber_count(), 2);
		assert_eq!(feed.emit(event(1, "bd/b1")), 2);
		assert_eq!(feed.emit(event(1, "if/if1")), 2);

		assert_eq!(all.next().await.unwrap().outcome.key, "bd/b1");
		assert_eq!(interfaces.next().await.unwrap().outcome.key, "if/if1");
	}

	#[tokio::test]
	async fn test_lagged_watcher_keeps_receiving() {
		let feed = StatusFeed::new(2);
		let mut watcher = feed.watch(None);

		for seq in 1..=5 {
			feed.emit(event(seq, "if/if1"));
		}

		assert_eq!(watcher.next().await.unwrap().txn_seq, 4);
		assert_eq!(watcher.next().await.unwrap().txn_seq, 5);
	}

	#[test]
	fn test_status_serialization() {
		let json = serde_json::to_value(ValueStatus::Pending(vec![
			"interface-exists:if/if1".to_string(),
		]))
		.unwrap();

		assert_eq!(
			json,
			serde_json::json!({"status": "pending", "details": ["interface-exists:if/if1"]})
		);
	}
}
