use tokio::sync::oneshot;

use super::{
	error::Error,
	resync::ResyncStrategy,
	txn::{Transaction, TxnReport},
	value::{Key, SharedMetadata, SharedValue},
};

/// Requests processed, in arrival order, by the transaction intake loop.
#[derive(Debug)]
pub(crate) enum Request {
	Txn {
		txn: Transaction,
		reply: oneshot::Sender<TxnReport>,
	},
	Resync {
		strategy: ResyncStrategy,
		scope: Option<Vec<String>>,
		reply: oneshot::Sender<Result<TxnReport, Error>>,
	},
	Notification {
		key: Key,
		value: Option<SharedValue>,
		metadata: Option<SharedMetadata>,
		reply: oneshot::Sender<TxnReport>,
	},
	/// Sent by the retry loop, `batches` trigger sets merged into one.
	Retry { keys: Vec<Key>, batches: usize },
	Barrier(oneshot::Sender<()>),
}
