use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
	error::KeyError,
	graph::ValueState,
	resync::ResyncStrategy,
	status::KeyOutcome,
	txn::{RetrieveFailure, TxnKind, TxnOperation},
	value::Key,
};

/// Input value of a recorded transaction. Values are kept in their debug rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedValue {
	pub key: Key,
	pub value: Option<String>,
}

/// One executed (or planned) descriptor operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedOp {
	pub key: Key,
	pub derived_from: Option<Key>,
	pub operation: TxnOperation,
	/// Part of a delete + create pair replacing a value.
	pub is_recreate: bool,
	pub prev_value: Option<String>,
	pub new_value: Option<String>,
	pub prev_state: ValueState,
	pub new_state: ValueState,
	pub error: Option<KeyError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnRecord {
	pub seq_num: u64,
	pub kind: TxnKind,
	pub description: Option<String>,
	pub resync: Option<ResyncStrategy>,
	pub dry_run: bool,
	pub start: DateTime<Utc>,
	pub stop: DateTime<Utc>,
	pub values: Vec<RecordedValue>,
	pub executed: Vec<RecordedOp>,
	pub outcomes: Vec<KeyOutcome>,
	pub retrieve_errors: Vec<RetrieveFailure>,
}

/// Last `capacity` transaction records, oldest first.
#[derive(Debug)]
pub(crate) struct TxnHistory {
	records: VecDeque<TxnRecord>,
	capacity: usize,
}

impl TxnHistory {
	pub(crate) fn new(capacity: usize) -> Self {
		Self {
			records: VecDeque::with_capacity(capacity.min(1024)),
			capacity,
		}
	}

	pub(crate) fn push(&mut self, record: TxnRecord) {
		if self.capacity == 0 {
			return;
		}

		while self.records.len() >= self.capacity {
			self.records.pop_front();
		}
		self.records.push_back(record);
	}

	pub(crate) fn get(&self, seq_num: u64) -> Option<&TxnRecord> {
		self.records
			.iter()
			.rev()
			.find(|record| record.seq_num == seq_num)
	}

	pub(crate) fn all(&self) -> Vec<TxnRecord> {
		self.records.iter().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(seq_num: u64) -> TxnRecord {
		let now = Utc::now();
		TxnRecord {
			seq_num,
			kind: TxnKind::Northbound,
			description: None,
			resync: None,
			dry_run: false,
			start: now,
			stop: now,
			values: Vec::new(),
			executed: Vec::new(),
			outcomes: Vec::new(),
			retrieve_errors: Vec::new(),
		}
	}

	#[test]
	fn test_history_keeps_last_records() {
		let mut history = TxnHistory::new(2);
		for seq in 0..5 {
			history.push(record(seq));
		}

		assert_eq!(
			history
				.all()
				.iter()
				.map(|record| record.seq_num)
				.collect::<Vec<_>>(),
			vec![3, 4]
		);
		assert!(history.get(2).is_none());
		assert!(history.get(4).is_some());
	}
}
