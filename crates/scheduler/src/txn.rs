use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
	error::OperationError,
	record::{RecordedOp, TxnRecord},
	resync::ResyncStrategy,
	status::{KeyOutcome, ValueStatus},
	value::{Key, SharedValue, Value},
};

/// Descriptor operation kinds, as recorded in transaction history.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxnOperation {
	Create,
	Update,
	Delete,
}

/// What triggered a transaction.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxnKind {
	/// Submitted by the northbound plane, possibly as a full desired-state snapshot.
	Northbound,
	/// Change notified by the forwarding engine.
	SbNotification,
	/// Re-evaluation of pending values whose dependencies got applied.
	RetryPending,
	/// Explicit resync of the southbound state.
	Resync,
}

#[derive(Debug, Clone)]
pub struct TxnItem {
	pub key: Key,
	/// `None` requests deletion.
	pub value: Option<SharedValue>,
}

#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
	pub description: Option<String>,
	/// Plan only, without calling descriptors.
	pub dry_run: bool,
	/// Marks the transaction as a full desired-state snapshot: every northbound value not
	/// listed is removed, after refreshing the southbound state with this strategy.
	pub resync: Option<ResyncStrategy>,
}

/// Ordered batch of desired changes. Built fluently and handed to
/// [`Scheduler::submit`](crate::Scheduler::submit).
///
/// ```
/// use nca_scheduler::Transaction;
///
/// let txn = Transaction::new()
/// 	.put("if/eth0", 1500_u32)
/// 	.delete("if/eth1")
/// 	.with_description("mtu change");
///
/// assert_eq!(txn.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Transaction {
	items: Vec<TxnItem>,
	options: TxnOptions,
}

impl Transaction {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Full desired-state snapshot, reconciled after a resync with the given strategy.
	#[must_use]
	pub fn snapshot(strategy: ResyncStrategy) -> Self {
		Self {
			items: Vec::new(),
			options: TxnOptions {
				resync: Some(strategy),
				..Default::default()
			},
		}
	}

	#[must_use]
	pub fn put(self, key: impl Into<Key>, value: impl Value) -> Self {
		self.put_shared(key, Arc::new(value))
	}

	#[must_use]
	pub fn put_shared(self, key: impl Into<Key>, value: SharedValue) -> Self {
		self.push(key.into(), Some(value))
	}

	#[must_use]
	pub fn delete(self, key: impl Into<Key>) -> Self {
		self.push(key.into(), None)
	}

	#[must_use]
	pub fn with_description(mut self, description: impl Into<String>) -> Self {
		self.options.description = Some(description.into());
		self
	}

	#[must_use]
	pub fn dry_run(mut self) -> Self {
		self.options.dry_run = true;
		self
	}

	/// A later change of the same key replaces the earlier one.
	fn push(mut self, key: Key, value: Option<SharedValue>) -> Self {
		self.items.retain(|item| item.key != key);
		self.items.push(TxnItem { key, value });
		self
	}

	#[must_use]
	pub fn items(&self) -> &[TxnItem] {
		&self.items
	}

	#[must_use]
	pub const fn options(&self) -> &TxnOptions {
		&self.options
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.items.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub(crate) fn into_parts(self) -> (Vec<TxnItem>, TxnOptions) {
		(self.items, self.options)
	}
}

/// A descriptor whose `Retrieve` failed during a resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveFailure {
	pub descriptor: String,
	pub error: OperationError,
}

/// Per-key outcome of a processed transaction. Never all-or-nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnReport {
	pub seq_num: u64,
	pub dry_run: bool,
	pub outcomes: Vec<KeyOutcome>,
	/// Descriptor operations executed, or planned for a dry run, in order.
	pub executed: Vec<RecordedOp>,
	pub retrieve_errors: Vec<RetrieveFailure>,
}

impl TxnReport {
	#[must_use]
	pub fn outcome(&self, key: &str) -> Option<&ValueStatus> {
		self.outcomes
			.iter()
			.find(|outcome| outcome.key == key)
			.map(|outcome| &outcome.status)
	}

	/// Outcomes that are failures.
	pub fn errors(&self) -> impl Iterator<Item = &KeyOutcome> {
		self.outcomes
			.iter()
			.filter(|outcome| outcome.status.is_failed())
	}

	#[must_use]
	pub fn is_success(&self) -> bool {
		self.errors().next().is_none() && self.retrieve_errors.is_empty()
	}
}

impl From<&TxnRecord> for TxnReport {
	fn from(record: &TxnRecord) -> Self {
		Self {
			seq_num: record.seq_num,
			dry_run: record.dry_run,
			outcomes: record.outcomes.clone(),
			executed: record.executed.clone(),
			retrieve_errors: record.retrieve_errors.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_later_change_of_same_key_wins() {
		let txn = Transaction::new()
			.put("if/a", 1_u32)
			.put("if/b", 2_u32)
			.delete("if/a");

		let keys = txn
			.items()
			.iter()
			.map(|item| (item.key.as_str(), item.value.is_some()))
			.collect::<Vec<_>>();
		assert_eq!(keys, vec![("if/b", true), ("if/a", false)]);
	}

	#[test]
	fn test_snapshot_options() {
		let txn = Transaction::snapshot(ResyncStrategy::Full)
			.with_description("startup")
			.dry_run();

		assert_eq!(txn.options().resync, Some(ResyncStrategy::Full));
		assert_eq!(txn.options().description.as_deref(), Some("startup"));
		assert!(txn.options().dry_run);
		assert!(txn.is_empty());
	}
}
