//! Northbound source: a JSON file holding the whole desired state.
//!
//! The file is watched for changes. Every change, and the initial read, is pushed to the scheduler
//! as a full desired-state snapshot, so whatever is missing from the file gets removed.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_channel as chan;
use nca_mock_engine::decode_value;
use nca_scheduler::{ResyncStrategy, Scheduler, Transaction, TxnReport};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::AgentConfig;

/// Contents of the desired-state file, a missing file being an empty desired state.
async fn read_contents(path: &Path) -> Result<String> {
	match tokio::fs::read_to_string(path).await {
		Ok(contents) => Ok(contents),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			warn!(?path, "Desired-state file not found, assuming an empty desired state");
			Ok(String::from("{}"))
		}
		Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
	}
}

/// Parses the contents of the desired-state file into a snapshot transaction.
///
/// Any undecodable entry rejects the whole file, a partial snapshot would remove the values that
/// failed to decode.
pub fn parse_desired_state(
	path: &Path,
	contents: &str,
	strategy: ResyncStrategy,
) -> Result<Transaction> {
	let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(contents)
		.with_context(|| format!("malformed desired state in {}", path.display()))?;

	entries.into_iter().try_fold(
		Transaction::snapshot(strategy)
			.with_description(format!("desired state from {}", path.display())),
		|txn, (key, value)| -> Result<Transaction> {
			let value = decode_value(&key, value)?;
			Ok(txn.put_shared(key, value))
		},
	)
}

/// Reads and parses the desired-state file.
pub async fn read_desired_state(path: &Path, strategy: ResyncStrategy) -> Result<Transaction> {
	let contents = read_contents(path).await?;
	parse_desired_state(path, &contents, strategy)
}

/// Logs the failures of a processed transaction.
pub fn log_report(report: &TxnReport) {
	for outcome in report.errors() {
		warn!(
			txn_seq = report.seq_num,
			key = %outcome.key,
			status = %outcome.status,
			"Value failed"
		);
	}
	for failure in &report.retrieve_errors {
		warn!(
			txn_seq = report.seq_num,
			descriptor = %failure.descriptor,
			error = %failure.error,
			"Retrieve failed"
		);
	}

	let pending = report
		.outcomes
		.iter()
		.filter(|outcome| outcome.status.is_pending())
		.count();

	info!(
		txn_seq = report.seq_num,
		keys = report.outcomes.len(),
		operations = report.executed.len(),
		pending,
		success = report.is_success(),
		"Transaction processed"
	);
}

/// Keeps the scheduler in sync with the desired-state file, and periodically with the forwarding
/// engine. Returns only if the scheduler shuts down or the file can't be watched.
pub struct DesiredStateSource {
	scheduler: Scheduler,
	path: PathBuf,
	config: AgentConfig,
	last_contents: Option<String>,
}

impl DesiredStateSource {
	#[must_use]
	pub fn new(scheduler: Scheduler, path: PathBuf, config: AgentConfig) -> Self {
		Self {
			scheduler,
			path,
			config,
			last_contents: None,
		}
	}

	/// Watches the directory holding the file, which may get replaced rather than rewritten.
	fn watch(&self) -> Result<(RecommendedWatcher, chan::Receiver<notify::Result<Event>>)> {
		let (events_tx, events_rx) = chan::unbounded();

		let mut watcher = RecommendedWatcher::new(
			move |result: notify::Result<Event>| {
				// Unbounded, so this never blocks the watcher thread.
				if !events_tx.is_closed() && events_tx.send_blocking(result).is_err() {
					error!("Unable to forward desired-state file event");
				}
			},
			Config::default(),
		)
		.context("failed to create the desired-state file watcher")?;

		let dir = match self.path.parent() {
			Some(parent) if !parent.as_os_str().is_empty() => parent,
			_ => Path::new("."),
		};
		watcher
			.watch(dir, RecursiveMode::NonRecursive)
			.with_context(|| format!("failed to watch {}", dir.display()))?;

		Ok((watcher, events_rx))
	}

	fn concerns(&self, event: &Event) -> bool {
		if matches!(event.kind, EventKind::Access(_)) {
			return false;
		}

		let name = self.path.file_name();
		event
			.paths
			.iter()
			.any(|path| path.file_name() == name)
	}

	/// Pushes the current file contents as a snapshot. Returns `false` once the scheduler is gone.
	///
	/// With `only_if_changed`, contents identical to the last successful sync are not resubmitted.
	async fn sync(&mut self, strategy: ResyncStrategy, only_if_changed: bool) -> bool {
		let contents = match read_contents(&self.path).await {
			Ok(contents) => contents,
			Err(e) => {
				error!(?e, "Failed to read desired state, keeping the current one");
				return true;
			}
		};

		if only_if_changed && self.last_contents.as_deref() == Some(contents.as_str()) {
			debug!(path = ?self.path, "Desired state unchanged");
			return true;
		}

		let txn = match parse_desired_state(&self.path, &contents, strategy) {
			Ok(txn) => txn,
			Err(e) => {
				error!(?e, "Failed to load desired state, keeping the current one");
				// Don't report the same broken file on every event.
				self.last_contents = Some(contents);
				return true;
			}
		};

		debug!(values = txn.len(), %strategy, "Submitting desired state");

		match self.scheduler.submit(txn).await {
			Ok(report) => {
				log_report(&report);
				self.last_contents = Some(contents);
				true
			}
			Err(e) => {
				error!(?e, "Scheduler rejected the desired state");
				false
			}
		}
	}

	pub async fn run(mut self) {
		let (_watcher, events_rx) = match self.watch() {
			Ok(watch) => watch,
			Err(e) => {
				error!(?e, "Unable to watch the desired-state file");
				return;
			}
		};

		if !self.sync(self.config.startup_resync, false).await {
			return;
		}

		let mut resync = self.config.resync_interval().map(|period| {
			let mut resync = interval(period);
			resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
			resync.reset();
			resync
		});

		// Set by a change notification, pushed back by every further one.
		let mut settle_at: Option<Instant> = None;

		loop {
			tokio::select! {
				event = events_rx.recv() => match event {
					Ok(Ok(event)) if self.concerns(&event) => {
						settle_at = Some(Instant::now() + self.config.debounce());
					}
					Ok(Ok(_)) => {}
					Ok(Err(e)) => error!(?e, "Desired-state file watcher error"),
					Err(_) => {
						error!("Desired-state file watcher stopped");
						return;
					}
				},

				() = async {
					match settle_at {
						Some(deadline) => sleep_until(deadline).await,
						None => std::future::pending().await,
					}
				} => {
					settle_at = None;
					info!(path = ?self.path, "Desired state changed");
					if !self.sync(ResyncStrategy::Skip, true).await {
						return;
					}
				}

				_ = async {
					match resync.as_mut() {
						Some(resync) => {
							resync.tick().await;
						}
						None => std::future::pending::<()>().await,
					}
				} => {
					info!(strategy = %self.config.periodic_resync, "Periodic resync");
					match self.scheduler.resync(self.config.periodic_resync, None).await {
						Ok(report) => log_report(&report),
						Err(e) => {
							error!(?e, "Periodic resync failed");
							return;
						}
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{fs, sync::Arc, time::Duration};

	use nca_mock_engine::{model::Interface, register_all, MockEngine};
	use nca_scheduler::{cast, MetadataStore, Registry, SchedulerConfig, ValueState};
	use tempfile::tempdir;
	use tracing_test::traced_test;

	use super::*;

	fn scheduler() -> Scheduler {
		let engine = Arc::new(MockEngine::new());
		let metadata = MetadataStore::new();

		let mut builder = Registry::builder();
		register_all(&mut builder, &engine, &metadata).unwrap();

		Scheduler::new(
			builder.build().unwrap(),
			metadata,
			SchedulerConfig {
				retry_merge_window_ms: 1,
				shutdown_timeout_secs: 5,
				..Default::default()
			},
		)
	}

	#[tokio::test]
	async fn test_read_desired_state() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("desired.json");
		fs::write(
			&path,
			r#"{
				"if/tap0": {"kind": "tap", "enabled": true},
				"bd/b1": {"flood": true, "interfaces": [{"name": "tap0"}]}
			}"#,
		)
		.unwrap();

		let txn = read_desired_state(&path, ResyncStrategy::Full).await.unwrap();

		assert_eq!(txn.options().resync, Some(ResyncStrategy::Full));
		assert_eq!(txn.len(), 2);
		let interface = txn
			.items()
			.iter()
			.find(|item| item.key == "if/tap0")
			.and_then(|item| item.value.as_ref())
			.and_then(|value| cast::<Interface>(value.as_ref()).cloned())
			.unwrap();
		assert!(interface.enabled);
	}

	#[tokio::test]
	async fn test_undecodable_entry_rejects_the_file() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("desired.json");
		fs::write(
			&path,
			r#"{"if/tap0": {"kind": "tap"}, "acl/a1": {}}"#,
		)
		.unwrap();

		assert!(read_desired_state(&path, ResyncStrategy::Skip).await.is_err());

		let missing = read_desired_state(&dir.path().join("nope.json"), ResyncStrategy::Skip)
			.await
			.unwrap();
		assert!(missing.is_empty());
	}

	#[tokio::test]
	#[traced_test]
	async fn test_unchanged_file_is_not_resubmitted() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("desired.json");
		let contents = r#"{"if/tap0": {"kind": "tap"}}"#;
		fs::write(&path, contents).unwrap();

		let scheduler = scheduler();
		let mut source =
			DesiredStateSource::new(scheduler.clone(), path.clone(), AgentConfig::default());

		assert!(source.sync(ResyncStrategy::Skip, true).await);
		assert_eq!(source.last_contents.as_deref(), Some(contents));
		assert_eq!(scheduler.history().len(), 1);

		assert!(source.sync(ResyncStrategy::Skip, true).await);
		assert_eq!(scheduler.history().len(), 1);

		// A broken file is remembered as is and reported once.
		fs::write(&path, "{").unwrap();
		assert!(source.sync(ResyncStrategy::Skip, true).await);
		assert_eq!(source.last_contents.as_deref(), Some("{"));
		assert_eq!(scheduler.history().len(), 1);

		scheduler.shutdown().await;
	}

	#[tokio::test]
	#[traced_test]
	async fn test_file_changes_are_applied() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("desired.json");
		fs::write(&path, r#"{"if/tap0": {"kind": "tap"}}"#).unwrap();

		let scheduler = scheduler();
		let config = AgentConfig {
			debounce_ms: 10,
			resync_interval_secs: 0,
			..Default::default()
		};
		let mut watcher = scheduler.watch(|key| key == "if/tap0" || key == "if/tap1");
		let source = tokio::spawn(
			DesiredStateSource::new(scheduler.clone(), path.clone(), config).run(),
		);

		let event = tokio::time::timeout(Duration::from_secs(5), watcher.next())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(event.outcome.key, "if/tap0");

		fs::write(&path, r#"{"if/tap1": {"kind": "tap"}}"#).unwrap();

		let mut keys = Vec::new();
		while keys.len() < 2 {
			let event = tokio::time::timeout(Duration::from_secs(5), watcher.next())
				.await
				.unwrap()
				.unwrap();
			keys.push(event.outcome.key);
		}
		keys.sort();
		assert_eq!(keys, vec!["if/tap0", "if/tap1"]);

		scheduler.barrier().await.unwrap();
		assert_eq!(scheduler.value("if/tap1").state, ValueState::Configured);
		assert_eq!(scheduler.value("if/tap0").state, ValueState::Removed);

		source.abort();
		scheduler.shutdown().await;
	}
}
