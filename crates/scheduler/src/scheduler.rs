use std::{
	collections::BTreeSet,
	pin::pin,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::oneshot, time::sleep};
use tracing::{debug, info, instrument, warn};

use super::{
	config::SchedulerConfig,
	error::Error,
	executor::{Executed, Executor},
	graph::{GraphSnapshot, ValueState, ValueView},
	message::Request,
	metadata::MetadataStore,
	record::{TxnHistory, TxnRecord},
	registry::Registry,
	resync::ResyncStrategy,
	status::{StatusEvent, StatusFeed, StatusWatcher},
	txn::{Transaction, TxnReport},
	value::{Key, SharedMetadata, SharedValue},
	worker::{LoopHandle, Stopper},
};

/// State published by the intake loop for readers.
struct Shared {
	snapshot: RwLock<Arc<GraphSnapshot>>,
	history: RwLock<TxnHistory>,
	/// Trigger sets handed to the retry loop whose retry transaction was not processed yet.
	in_flight_retries: AtomicUsize,
}

struct Inner {
	requests_tx: chan::Sender<Request>,
	registry: Arc<Registry>,
	metadata: MetadataStore,
	feed: StatusFeed,
	shared: Arc<Shared>,
	interrupted: Arc<AtomicBool>,
	loops: Mutex<Option<(LoopHandle, LoopHandle)>>,
	shutdown_timeout: Duration,
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.interrupted.store(true, Ordering::Release);
		self.requests_tx.close();
	}
}

/// The reconciliation engine.
///
/// Cheap to clone, every clone talks to the same background loops: the intake loop, which owns
/// the graph and processes requests strictly in arrival order, and the retry loop, which turns
/// resolved pending values into retry transactions.
#[derive(Clone)]
pub struct Scheduler {
	inner: Arc<Inner>,
}

impl Scheduler {
	/// Starts the background loops. Must be called from within a tokio runtime.
	///
	/// `metadata` is the store the descriptors of `registry` were given, so that they can resolve
	/// each other's handles.
	#[must_use]
	pub fn new(registry: Registry, metadata: MetadataStore, config: SchedulerConfig) -> Self {
		let registry = Arc::new(registry);
		let interrupted = Arc::new(AtomicBool::new(false));

		let (requests_tx, requests_rx) = chan::bounded(config.queue_capacity.max(1));
		let (retry_tx, retry_rx) = chan::unbounded();

		let shared = Arc::new(Shared {
			snapshot: RwLock::default(),
			history: RwLock::new(TxnHistory::new(config.history_capacity)),
			in_flight_retries: AtomicUsize::new(0),
		});
		let feed = StatusFeed::new(config.status_feed_capacity);

		let executor = Executor::new(
			Arc::clone(&registry),
			metadata.clone(),
			Arc::clone(&interrupted),
			config.history_capacity as u64,
		);

		let intake = LoopHandle::spawn("intake", {
			let shared = Arc::clone(&shared);
			let feed = feed.clone();
			move |stop| run_intake(executor, requests_rx, retry_tx, shared, feed, stop)
		});

		let retry = LoopHandle::spawn("retry", {
			let requests_tx = requests_tx.clone();
			let merge_window = config.retry_merge_window();
			move |stop| run_retry(retry_rx, requests_tx, merge_window, stop)
		});

		info!(?registry, "Scheduler started");

		Self {
			inner: Arc::new(Inner {
				requests_tx,
				registry,
				metadata,
				feed,
				shared,
				interrupted,
				loops: Mutex::new(Some((intake, retry))),
				shutdown_timeout: config.shutdown_timeout(),
			}),
		}
	}

	async fn request<T>(
		&self,
		make: impl FnOnce(oneshot::Sender<T>) -> Request,
	) -> Result<T, Error> {
		let (reply, rx) = oneshot::channel();

		self.inner
			.requests_tx
			.send(make(reply))
			.await
			.map_err(|_| Error::Shutdown)?;

		rx.await.map_err(|_| Error::OutcomeDropped)
	}

	/// Processes a transaction and reports the outcome of every key it touched.
	pub async fn submit(&self, txn: Transaction) -> Result<TxnReport, Error> {
		self.request(|reply| Request::Txn { txn, reply }).await
	}

	/// Refreshes the southbound state and reconciles the desired state against it.
	///
	/// `scope` restricts the resync to the named descriptors.
	pub async fn resync(
		&self,
		strategy: ResyncStrategy,
		scope: Option<Vec<String>>,
	) -> Result<TxnReport, Error> {
		self.request(|reply| Request::Resync {
			strategy,
			scope,
			reply,
		})
		.await?
	}

	/// Records a change that already happened in the forwarding engine. `value: None` notifies a
	/// removal. Ignored for keys managed by the northbound plane.
	pub async fn push_sb_notification(
		&self,
		key: impl Into<Key> + Send,
		value: Option<SharedValue>,
		metadata: Option<SharedMetadata>,
	) -> Result<TxnReport, Error> {
		let key = key.into();
		self.request(|reply| Request::Notification {
			key,
			value,
			metadata,
			reply,
		})
		.await
	}

	/// Resolves once every request enqueued before it, and every retry they caused, is processed.
	pub async fn barrier(&self) -> Result<(), Error> {
		self.request(Request::Barrier).await
	}

	#[must_use]
	pub fn subscribe(&self) -> StatusWatcher {
		self.inner.feed.watch(None)
	}

	/// Status events of the keys passing `selector`.
	#[must_use]
	pub fn watch(&self, selector: impl Fn(&str) -> bool + Send + Sync + 'static) -> StatusWatcher {
		self.inner.feed.watch(Some(Arc::new(selector)))
	}

	#[must_use]
	pub fn registry(&self) -> &Registry {
		&self.inner.registry
	}

	#[must_use]
	pub fn metadata(&self) -> &MetadataStore {
		&self.inner.metadata
	}

	#[must_use]
	pub fn lookup_by_key(&self, descriptor: &str, key: &str) -> Option<SharedMetadata> {
		self.inner.metadata.lookup_by_key(descriptor, key)
	}

	#[must_use]
	pub fn lookup_by_handle(&self, descriptor: &str, handle: u32) -> Option<(Key, SharedMetadata)> {
		self.inner.metadata.lookup_by_handle(descriptor, handle)
	}

	fn snapshot(&self) -> Arc<GraphSnapshot> {
		Arc::clone(&self.inner.shared.snapshot.read())
	}

	/// View of one value as of the last processed request.
	#[must_use]
	pub fn value(&self, key: &str) -> ValueView {
		self.snapshot()
			.get(key)
			.cloned()
			.unwrap_or_else(|| ValueView::non_existent(key))
	}

	/// Known values (desired, applied or failed) whose key passes `selector`.
	pub fn values(&self, selector: impl Fn(&str) -> bool) -> Vec<ValueView> {
		self.filter_values(|view| {
			!matches!(view.state, ValueState::NonExistent | ValueState::Removed)
				&& selector(&view.key)
		})
	}

	pub fn pending_values(&self, selector: impl Fn(&str) -> bool) -> Vec<ValueView> {
		self.filter_values(|view| view.state == ValueState::Pending && selector(&view.key))
	}

	/// Values whose last operation failed, that are invalid, or that no descriptor implements.
	pub fn failed_values(&self, selector: impl Fn(&str) -> bool) -> Vec<ValueView> {
		self.filter_values(|view| {
			matches!(
				view.state,
				ValueState::Failed | ValueState::Invalid | ValueState::Unimplemented
			) && selector(&view.key)
		})
	}

	fn filter_values(&self, filter: impl Fn(&ValueView) -> bool) -> Vec<ValueView> {
		self.snapshot()
			.values()
			.filter(|view| filter(view))
			.cloned()
			.collect()
	}

	/// Records of the last processed transactions, oldest first.
	#[must_use]
	pub fn history(&self) -> Vec<TxnRecord> {
		self.inner.shared.history.read().all()
	}

	#[must_use]
	pub fn txn_record(&self, seq_num: u64) -> Option<TxnRecord> {
		self.inner.shared.history.read().get(seq_num).cloned()
	}

	/// Stops the background loops. The transaction in progress, if any, leaves its remaining
	/// values pending; queued requests are dropped.
	pub async fn shutdown(&self) {
		let Some((mut intake, mut retry)) = self.inner.loops.lock().take() else {
			warn!("Scheduler already shut down");
			return;
		};

		self.inner.interrupted.store(true, Ordering::Release);

		retry.stop(self.inner.shutdown_timeout).await;
		intake.stop(self.inner.shutdown_timeout).await;

		self.inner.requests_tx.close();
		info!("Scheduler shut down");
	}
}

#[instrument(skip_all)]
async fn run_intake(
	mut executor: Executor,
	requests_rx: chan::Receiver<Request>,
	retry_tx: chan::Sender<Vec<Key>>,
	shared: Arc<Shared>,
	feed: StatusFeed,
	stop: Stopper,
) {
	enum StreamMessage {
		Request(Request),
		Stop,
	}

	let mut msg_stream = pin!((
		requests_rx.map(StreamMessage::Request),
		stop.into_stream().map(|()| StreamMessage::Stop),
	)
		.merge());

	let mut barriers = Vec::new();

	while let Some(msg) = msg_stream.next().await {
		let request = match msg {
			StreamMessage::Stop => break,
			StreamMessage::Request(request) => request,
		};

		match request {
			Request::Txn { txn, reply } => {
				let executed = executor.execute(txn).await;
				let report = publish(executed, &executor, &shared, &feed, &retry_tx);
				if reply.send(report).is_err() {
					debug!("Transaction submitter went away before the outcome");
				}
			}

			Request::Resync {
				strategy,
				scope,
				reply,
			} => {
				let result = executor
					.resync(strategy, scope)
					.await
					.map(|executed| publish(executed, &executor, &shared, &feed, &retry_tx));
				if reply.send(result).is_err() {
					debug!("Resync requester went away before the outcome");
				}
			}

			Request::Notification {
				key,
				value,
				metadata,
				reply,
			} => {
				let executed = executor.notify(key, value, metadata).await;
				let report = publish(executed, &executor, &shared, &feed, &retry_tx);
				// Notifiers rarely wait for the report.
				reply.send(report).ok();
			}

			Request::Retry { keys, batches } => {
				let executed = executor.retry(keys).await;
				publish(executed, &executor, &shared, &feed, &retry_tx);
				shared
					.in_flight_retries
					.fetch_sub(batches, Ordering::AcqRel);
			}

			Request::Barrier(ack) => barriers.push(ack),
		}

		if !barriers.is_empty() && shared.in_flight_retries.load(Ordering::Acquire) == 0 {
			for ack in barriers.drain(..) {
				ack.send(()).ok();
			}
		}
	}

	debug!("Intake loop stopped");
}

/// Publishes the outcome of a processed request: status events, graph snapshot, history, and
/// hands new triggers to the retry loop.
fn publish(
	executed: Executed,
	executor: &Executor,
	shared: &Shared,
	feed: &StatusFeed,
	retry_tx: &chan::Sender<Vec<Key>>,
) -> TxnReport {
	let Executed { record, triggers } = executed;

	if !record.dry_run {
		for outcome in &record.outcomes {
			feed.emit(StatusEvent {
				txn_seq: record.seq_num,
				outcome: outcome.clone(),
			});
		}

		*shared.snapshot.write() = Arc::new(executor.snapshot());
	}

	if !triggers.is_empty() {
		shared.in_flight_retries.fetch_add(1, Ordering::AcqRel);

		if retry_tx.try_send(triggers).is_err() {
			warn!("Retry loop is gone, pending values will wait for the next resync");
			shared.in_flight_retries.fetch_sub(1, Ordering::AcqRel);
		}
	}

	let report = TxnReport::from(&record);
	shared.history.write().push(record);

	report
}

#[instrument(skip_all)]
async fn run_retry(
	retry_rx: chan::Receiver<Vec<Key>>,
	requests_tx: chan::Sender<Request>,
	merge_window: Duration,
	stop: Stopper,
) {
	enum StreamMessage {
		Triggers(Vec<Key>),
		Stop,
	}

	let mut msg_stream = pin!((
		retry_rx.clone().map(StreamMessage::Triggers),
		stop.into_stream().map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		let keys = match msg {
			StreamMessage::Stop => break,
			StreamMessage::Triggers(keys) => keys,
		};

		if !merge_window.is_zero() {
			sleep(merge_window).await;
		}

		let mut keys = keys.into_iter().collect::<BTreeSet<_>>();
		let mut batches = 1;
		while let Ok(more) = retry_rx.try_recv() {
			keys.extend(more);
			batches += 1;
		}

		debug!(keys = keys.len(), batches, "Submitting retry of pending values");

		if requests_tx
			.send(Request::Retry {
				keys: keys.into_iter().collect(),
				batches,
			})
			.await
			.is_err()
		{
			warn!("Intake loop is gone, stopping retries");
			break;
		}
	}

	debug!("Retry loop stopped");
}
