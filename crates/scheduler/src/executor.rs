//! Transaction executor
//!
//! The executor owns the graph and the pending registry and is driven exclusively by the intake
//! loop, one request at a time. Every request goes through the same pipeline:
//!
//! 1. stage: new desired values are validated, their dependencies and derived values computed;
//! 2. removal: everything that has to go (deleted values, invalid replacements, recreations) is
//!    removed together with its dependents, dependents first;
//! 3. apply: the remaining working set is ordered dependencies first and every value is
//!    created, updated, skipped or parked as pending.
//!
//! A dry run executes the same pipeline on a copy of the graph without calling descriptors.

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace, warn};

use super::{
	descriptor::Descriptor,
	error::{Error, KeyError},
	graph::{Graph, GraphSnapshot, ValueState, DERIVED_FROM},
	metadata::MetadataStore,
	order::order_working_set,
	pending::PendingRegistry,
	record::{RecordedOp, RecordedValue, TxnRecord},
	registry::Registry,
	resync::ResyncStrategy,
	status::{KeyOutcome, ValueStatus},
	txn::{RetrieveFailure, Transaction, TxnItem, TxnKind, TxnOperation},
	value::{Dependency, DependencyTarget, Key, KeyValuePair, Origin, SharedMetadata, SharedValue},
};

/// Bound on the apply rounds of one transaction. Extra rounds only happen when applying a value
/// takes others down.
const MAX_APPLY_ROUNDS: usize = 8;

/// Result of one processed request.
#[derive(Debug)]
pub(crate) struct Executed {
	pub(crate) record: TxnRecord,
	/// Pending keys whose dependencies are now all applied.
	pub(crate) triggers: Vec<Key>,
}

struct Header {
	seq: u64,
	kind: TxnKind,
	description: Option<String>,
	resync: Option<ResyncStrategy>,
	dry_run: bool,
	start: DateTime<Utc>,
	values: Vec<RecordedValue>,
}

pub(crate) struct Executor {
	pub(super) registry: Arc<Registry>,
	pub(super) metadata: MetadataStore,
	pub(super) graph: Graph,
	pending: PendingRegistry,
	pub(super) seq: u64,
	/// Descriptors whose desired values changed since they were last retrieved.
	pub(super) dirty: HashSet<String>,
	/// Whether any resync refreshed the southbound state yet.
	pub(super) resynced: bool,
	pub(super) last_origin: HashMap<Key, Origin>,
	interrupted: Arc<AtomicBool>,
	/// Transactions a tombstone of a removed value survives.
	tombstone_window: u64,
}

impl Executor {
	pub(crate) fn new(
		registry: Arc<Registry>,
		metadata: MetadataStore,
		interrupted: Arc<AtomicBool>,
		tombstone_window: u64,
	) -> Self {
		Self {
			registry,
			metadata,
			graph: Graph::default(),
			pending: PendingRegistry::default(),
			seq: 0,
			dirty: HashSet::new(),
			resynced: false,
			last_origin: HashMap::new(),
			interrupted,
			tombstone_window,
		}
	}

	fn begin(&mut self, kind: TxnKind, description: Option<String>, items: &[TxnItem]) -> Header {
		self.seq += 1;

		Header {
			seq: self.seq,
			kind,
			description,
			resync: None,
			dry_run: false,
			start: Utc::now(),
			values: items
				.iter()
				.map(|item| RecordedValue {
					key: item.key.clone(),
					value: render(item.value.as_ref()),
				})
				.collect(),
		}
	}

	/// Northbound transaction, possibly a full desired-state snapshot.
	#[instrument(skip_all, fields(txn_seq = self.seq + 1, items = txn.len()))]
	pub(crate) async fn execute(&mut self, txn: Transaction) -> Executed {
		let (items, options) = txn.into_parts();
		let mut header = self.begin(TxnKind::Northbound, options.description, &items);
		header.resync = options.resync;
		header.dry_run = options.dry_run;

		let mut retrieve_errors = Vec::new();
		let mut failed_descriptors = HashSet::new();

		if let Some(strategy) = options.resync {
			if options.dry_run {
				debug!("Dry run of a snapshot plans against the current view, without retrieve");
			} else {
				self.mark_snapshot_changes(&items);
				let refreshed = self.refresh(strategy, None, Some(&items)).await;
				retrieve_errors = refreshed.failures;
				failed_descriptors = refreshed.failed;
			}
		}

		let mut forked;
		let graph = if options.dry_run {
			forked = self.graph.clone();
			&mut forked
		} else {
			&mut self.graph
		};

		let mut run = Run::new(
			graph,
			&self.registry,
			&self.metadata,
			&self.interrupted,
			header.seq,
			options.dry_run,
		);

		for item in &items {
			match &item.value {
				Some(value) => run.stage_put(&item.key, Arc::clone(value)),
				None => run.stage_delete(&item.key),
			}
		}

		if options.resync.is_some() {
			let listed = items
				.iter()
				.map(|item| item.key.as_str())
				.collect::<HashSet<_>>();
			run.stage_omitted(&listed);
			run.enlist_all(None);
			run.exclude_descriptors(&failed_descriptors);
		}

		run.reconcile().await;
		let result = run.finish();

		self.complete(header, result, retrieve_errors, options.resync.is_some())
	}

	/// Refreshes the southbound view and reconciles every known value against it.
	#[instrument(skip_all, fields(txn_seq = self.seq + 1, %strategy))]
	pub(crate) async fn resync(
		&mut self,
		strategy: ResyncStrategy,
		scope: Option<Vec<String>>,
	) -> Result<Executed, Error> {
		let scope = match scope {
			Some(names) => {
				if let Some(unknown) = names.iter().find(|name| self.registry.get(name).is_none()) {
					return Err(Error::DescriptorNotFound(unknown.clone()));
				}
				Some(names.into_iter().collect::<HashSet<_>>())
			}
			None => None,
		};

		let mut header = self.begin(TxnKind::Resync, None, &[]);
		header.resync = Some(strategy);

		let refreshed = self.refresh(strategy, scope.as_ref(), None).await;

		let mut run = Run::new(
			&mut self.graph,
			&self.registry,
			&self.metadata,
			&self.interrupted,
			header.seq,
			false,
		);
		run.enlist_all(scope.as_ref());
		run.exclude_descriptors(&refreshed.failed);
		run.reconcile().await;
		let result = run.finish();

		Ok(self.complete(header, result, refreshed.failures, scope.is_none()))
	}

	/// A change that already happened in the forwarding engine.
	#[instrument(skip_all, fields(txn_seq = self.seq + 1, %key))]
	pub(crate) async fn notify(
		&mut self,
		key: Key,
		value: Option<SharedValue>,
		metadata: Option<SharedMetadata>,
	) -> Executed {
		let header = self.begin(
			TxnKind::SbNotification,
			None,
			&[TxnItem {
				key: key.clone(),
				value: value.clone(),
			}],
		);

		let mut run = Run::new(
			&mut self.graph,
			&self.registry,
			&self.metadata,
			&self.interrupted,
			header.seq,
			false,
		);
		run.notify(&key, value, metadata).await;
		let result = run.finish();

		self.complete(header, result, Vec::new(), false)
	}

	/// Re-evaluates pending values.
	#[instrument(skip_all, fields(txn_seq = self.seq + 1, keys = keys.len()))]
	pub(crate) async fn retry(&mut self, keys: Vec<Key>) -> Executed {
		let header = self.begin(TxnKind::RetryPending, None, &[]);

		let keys = keys
			.into_iter()
			.filter(|key| self.pending.contains(key))
			.collect::<Vec<_>>();

		let mut run = Run::new(
			&mut self.graph,
			&self.registry,
			&self.metadata,
			&self.interrupted,
			header.seq,
			false,
		);
		for key in &keys {
			run.enlist(key);
		}
		run.reconcile().await;
		let result = run.finish();

		self.complete(header, result, Vec::new(), false)
	}

	fn complete(
		&mut self,
		header: Header,
		result: RunResult,
		retrieve_errors: Vec<RetrieveFailure>,
		rebuild_pending: bool,
	) -> Executed {
		let mut triggers = BTreeSet::new();

		if !header.dry_run {
			let keys = if rebuild_pending {
				self.pending.clear();
				self.graph
					.nodes()
					.filter(|node| node.state == ValueState::Pending)
					.map(|node| node.key.clone())
					.collect()
			} else {
				result.touched.clone()
			};

			for key in keys {
				match self.graph.get(&key) {
					Some(node) if node.state == ValueState::Pending => {
						let unmet = self
							.graph
							.unmet(&node.desired_deps)
							.into_iter()
							.cloned()
							.collect::<Vec<_>>();
						if unmet.is_empty() {
							triggers.insert(key.clone());
						}
						self.pending.insert(&key, unmet);
					}
					_ => {
						self.pending.remove(&key);
					}
				}
			}

			for key in &result.newly_applied {
				for waiting in self.pending.waiting_on(key) {
					if self.is_ready(&waiting) {
						triggers.insert(waiting);
					}
				}
			}

			self.dirty.extend(result.dirty);
			self.last_origin.extend(result.origins);
			for key in self
				.graph
				.prune(header.seq.saturating_sub(self.tombstone_window))
			{
				self.registry.forget(&key);
			}
		}

		let failed = result
			.outcomes
			.iter()
			.filter(|outcome| outcome.status.is_failed())
			.count();

		info!(
			txn_seq = header.seq,
			kind = %header.kind,
			dry_run = header.dry_run,
			outcomes = result.outcomes.len(),
			failed,
			pending = self.pending.len(),
			"Transaction processed"
		);

		Executed {
			record: TxnRecord {
				seq_num: header.seq,
				kind: header.kind,
				description: header.description,
				resync: header.resync,
				dry_run: header.dry_run,
				start: header.start,
				stop: Utc::now(),
				values: header.values,
				executed: result.executed,
				outcomes: result.outcomes,
				retrieve_errors,
			},
			triggers: triggers.into_iter().collect(),
		}
	}

	fn is_ready(&self, key: &str) -> bool {
		self.graph.get(key).is_some_and(|node| {
			node.state == ValueState::Pending
				&& node.desired.is_some()
				&& self.graph.unmet(&node.desired_deps).is_empty()
		})
	}

	pub(crate) fn snapshot(&self) -> GraphSnapshot {
		self.graph.snapshot()
	}
}

/// Everything a run leaves behind for the executor to commit.
struct RunResult {
	outcomes: Vec<KeyOutcome>,
	executed: Vec<RecordedOp>,
	/// Keys whose state may have changed, in the order they were first touched.
	touched: Vec<Key>,
	newly_applied: Vec<Key>,
	dirty: Vec<String>,
	origins: Vec<(Key, Origin)>,
}

/// One pass of the pipeline over a graph, which is a copy of the real one for dry runs.
pub(super) struct Run<'a> {
	pub(super) graph: &'a mut Graph,
	pub(super) registry: &'a Registry,
	metadata: &'a MetadataStore,
	interrupted: &'a AtomicBool,
	seq: u64,
	dry_run: bool,
	outcomes: Vec<KeyOutcome>,
	outcome_index: HashMap<Key, usize>,
	executed: Vec<RecordedOp>,
	/// Whether each touched key was applied when first touched.
	was_applied: HashMap<Key, bool>,
	touched: Vec<Key>,
	working: Vec<Key>,
	in_working: HashSet<Key>,
	recreating: HashSet<Key>,
	newly_applied: Vec<Key>,
	dirty: Vec<String>,
	origins: Vec<(Key, Origin)>,
}

impl<'a> Run<'a> {
	fn new(
		graph: &'a mut Graph,
		registry: &'a Registry,
		metadata: &'a MetadataStore,
		interrupted: &'a AtomicBool,
		seq: u64,
		dry_run: bool,
	) -> Self {
		Self {
			graph,
			registry,
			metadata,
			interrupted,
			seq,
			dry_run,
			outcomes: Vec::new(),
			outcome_index: HashMap::new(),
			executed: Vec::new(),
			was_applied: HashMap::new(),
			touched: Vec::new(),
			working: Vec::new(),
			in_working: HashSet::new(),
			recreating: HashSet::new(),
			newly_applied: Vec::new(),
			dirty: Vec::new(),
			origins: Vec::new(),
		}
	}

	fn finish(self) -> RunResult {
		RunResult {
			outcomes: self.outcomes,
			executed: self.executed,
			touched: self.touched,
			newly_applied: self.newly_applied,
			dirty: self.dirty,
			origins: self.origins,
		}
	}

	fn touch(&mut self, key: &str) {
		if !self.was_applied.contains_key(key) {
			self.was_applied
				.insert(key.to_string(), self.graph.is_applied(key));
			self.touched.push(key.to_string());
		}
	}

	fn was_applied(&self, key: &str) -> bool {
		self.was_applied.get(key).copied().unwrap_or(false)
	}

	fn set_outcome(&mut self, key: &str, status: ValueStatus) {
		let derived_from = self
			.graph
			.get(key)
			.and_then(|node| node.derived_from.clone());

		let outcome = KeyOutcome {
			key: key.to_string(),
			derived_from,
			status,
		};

		if let Some(&i) = self.outcome_index.get(key) {
			self.outcomes[i] = outcome;
		} else {
			self.outcome_index.insert(key.to_string(), self.outcomes.len());
			self.outcomes.push(outcome);
		}
	}

	fn fail(&mut self, key: &str, error: KeyError) {
		let node = self.graph.node_mut(key);
		node.state = match error {
			KeyError::Validation(_) => ValueState::Invalid,
			KeyError::Unimplemented => ValueState::Unimplemented,
			_ => ValueState::Failed,
		};
		node.error = Some(error.clone());
		node.unmet.clear();
		node.last_update = self.seq;

		debug!(txn_seq = self.seq, %key, %error, "Value failed");
		self.set_outcome(key, ValueStatus::Failed(error));
	}

	/// Adds a key, and its derived values, to the working set.
	pub(super) fn enlist(&mut self, key: &str) {
		if self.in_working.insert(key.to_string()) {
			self.working.push(key.to_string());
			self.touch(key);
		}

		let derived = self
			.graph
			.get(key)
			.map(|node| node.derived.iter().cloned().collect::<Vec<_>>())
			.unwrap_or_default();

		for derived in derived {
			if self.in_working.insert(derived.clone()) {
				self.touch(&derived);
				self.working.push(derived);
			}
		}
	}

	/// Leaves keys of the given descriptors, and their derived values, out of the working set.
	pub(super) fn exclude_descriptors(&mut self, descriptors: &HashSet<String>) {
		if descriptors.is_empty() {
			return;
		}

		let graph = &*self.graph;
		let excluded = |key: &Key| {
			graph.get(key).is_some_and(|node| {
				let base = node
					.derived_from
					.as_deref()
					.and_then(|parent| graph.get(parent))
					.unwrap_or(node);
				base.descriptor
					.as_ref()
					.is_some_and(|name| descriptors.contains(name))
			})
		};

		let (excluded, kept) = self
			.working
			.drain(..)
			.partition::<Vec<_>, _>(|key| excluded(key));

		for key in excluded {
			trace!(%key, "Left out of resync, retrieve failed");
			self.in_working.remove(&key);
		}
		self.working = kept;
	}

	/// Enlists every base value (restaging desired ones), optionally restricted to descriptors.
	pub(super) fn enlist_all(&mut self, scope: Option<&HashSet<String>>) {
		let candidates = self
			.graph
			.nodes()
			.filter(|node| node.derived_from.is_none())
			.filter(|node| node.desired.is_some() || node.is_applied())
			.filter(|node| {
				scope.map_or(true, |scope| {
					node.descriptor
						.as_ref()
						.is_some_and(|name| scope.contains(name))
				})
			})
			.map(|node| (node.key.clone(), node.desired.clone()))
			.collect::<Vec<_>>();

		for (key, desired) in candidates {
			if self.in_working.contains(&key) {
				continue;
			}

			match desired {
				Some(value) => self.stage_put(&key, value),
				None => self.enlist(&key),
			}
		}
	}

	/// Northbound put.
	pub(super) fn stage_put(&mut self, key: &str, value: SharedValue) {
		let descriptor = match self.registry.descriptor_for_key(key) {
			Ok(descriptor) => descriptor,
			Err(e) => {
				warn!(txn_seq = self.seq, %key, %e, "Key claimed by several descriptors");
				self.set_outcome(
					key,
					ValueStatus::Failed(KeyError::Registry {
						message: e.to_string(),
					}),
				);
				return;
			}
		};

		if let Some(base) = self
			.graph
			.get(key)
			.and_then(|node| node.derived_from.clone())
		{
			self.set_outcome(key, ValueStatus::Failed(KeyError::DerivedKey { base }));
			return;
		}

		self.touch(key);

		let Some(descriptor) = descriptor else {
			let node = self.graph.node_mut(key);
			node.desired = Some(value);
			node.desired_deps.clear();
			node.descriptor = None;
			self.fail(key, KeyError::Unimplemented);
			return;
		};

		let changed = self
			.graph
			.get(key)
			.and_then(|node| node.desired.as_ref())
			.map_or(true, |old| {
				!descriptor.equivalent_values(key, old.as_ref(), value.as_ref())
			});
		if changed {
			self.dirty.push(descriptor.name().to_string());
		}

		let node = self.graph.node_mut(key);
		node.descriptor = Some(descriptor.name().to_string());
		node.desired = Some(Arc::clone(&value));
		node.last_update = self.seq;

		if let Err(e) = descriptor.validate(key, value.as_ref()) {
			node.desired_deps.clear();
			self.fail(key, KeyError::Validation(e));
			self.retract_derived(key, &BTreeSet::new());
			self.enlist(key);
			return;
		}

		node.desired_deps = descriptor.dependencies(key, value.as_ref());
		node.error = None;
		if matches!(
			node.state,
			ValueState::Invalid
				| ValueState::Unimplemented
				| ValueState::Failed
				| ValueState::Removed
				| ValueState::NonExistent
		) {
			node.state = if node.is_applied() {
				ValueState::Configured
			} else {
				ValueState::Pending
			};
		}

		let derived = descriptor.derived_values(key, value.as_ref());
		self.stage_derived(key, derived);
		self.enlist(key);
	}

	/// Northbound delete.
	pub(super) fn stage_delete(&mut self, key: &str) {
		let descriptor = match self.registry.descriptor_for_key(key) {
			Ok(descriptor) => descriptor,
			Err(e) => {
				self.set_outcome(
					key,
					ValueStatus::Failed(KeyError::Registry {
						message: e.to_string(),
					}),
				);
				return;
			}
		};

		let Some(node) = self.graph.get(key) else {
			self.set_outcome(key, ValueStatus::Skipped);
			return;
		};

		if let Some(base) = node.derived_from.clone() {
			self.set_outcome(key, ValueStatus::Failed(KeyError::DerivedKey { base }));
			return;
		}

		if node.desired.is_none() && (!node.is_applied() || node.is_protected()) {
			self.set_outcome(key, ValueStatus::Skipped);
			return;
		}

		self.touch(key);
		if let Some(descriptor) = descriptor {
			self.dirty.push(descriptor.name().to_string());
		}

		let node = self.graph.node_mut(key);
		node.desired = None;
		node.desired_deps.clear();
		node.unmet.clear();
		node.error = None;
		node.last_update = self.seq;

		let applied = node.is_applied();
		if !applied {
			node.state = ValueState::Removed;
		}

		self.retract_derived(key, &BTreeSet::new());
		self.enlist(key);

		if !applied {
			self.set_outcome(key, ValueStatus::Deleted);
		}
	}

	/// Stages deletion of every northbound base value that is not listed in a snapshot.
	pub(super) fn stage_omitted(&mut self, listed: &HashSet<&str>) {
		let omitted = self
			.graph
			.nodes()
			.filter(|node| node.derived_from.is_none() && node.desired.is_some())
			.filter(|node| !listed.contains(node.key.as_str()))
			.map(|node| node.key.clone())
			.collect::<Vec<_>>();

		for key in omitted {
			self.stage_delete(&key);
		}
	}

	fn stage_derived(&mut self, parent: &str, items: Vec<KeyValuePair>) {
		let keep = items
			.iter()
			.map(|kv| kv.key.clone())
			.collect::<BTreeSet<_>>();
		self.retract_derived(parent, &keep);

		for KeyValuePair { key, value } in items {
			if key == parent {
				warn!(%key, "Value derives itself, ignoring");
				continue;
			}

			let descriptor = match self.registry.descriptor_for_key(&key) {
				Ok(descriptor) => descriptor,
				Err(e) => {
					self.set_outcome(
						&key,
						ValueStatus::Failed(KeyError::Registry {
							message: e.to_string(),
						}),
					);
					continue;
				}
			};

			self.touch(&key);
			self.graph
				.node_mut(parent)
				.derived
				.insert(key.clone());

			let mut deps = descriptor
				.as_ref()
				.map(|descriptor| descriptor.dependencies(&key, value.as_ref()))
				.unwrap_or_default();
			deps.push(Dependency::on(DERIVED_FROM, parent));

			let validation = descriptor
				.as_ref()
				.map_or(Ok(()), |descriptor| descriptor.validate(&key, value.as_ref()));

			let node = self.graph.node_mut(&key);
			node.derived_from = Some(parent.to_string());
			node.descriptor = descriptor.as_ref().map(|d| d.name().to_string());
			node.desired = Some(value);
			node.desired_deps = deps;
			node.error = None;
			node.last_update = self.seq;
			if !node.is_applied() {
				node.state = ValueState::Pending;
			}

			if let Err(e) = validation {
				self.fail(&key, KeyError::Validation(e));
			}
		}
	}

	/// Withdraws the desired side of derived values of `parent` that are not in `keep`.
	fn retract_derived(&mut self, parent: &str, keep: &BTreeSet<Key>) {
		let current = self
			.graph
			.get(parent)
			.map(|node| node.derived.clone())
			.unwrap_or_default();

		for key in current.difference(keep) {
			let Some(node) = self.graph.get(key) else {
				continue;
			};
			if node.desired.is_none() {
				continue;
			}

			self.touch(key);
			let node = self.graph.node_mut(key);
			node.desired = None;
			node.desired_deps.clear();
			node.unmet.clear();
			node.last_update = self.seq;

			if node.is_applied() {
				self.enlist(key);
			} else {
				node.state = ValueState::Removed;
				self.graph.node_mut(parent).derived.remove(key);
				self.set_outcome(key, ValueStatus::Deleted);
			}
		}
	}

	/// Removals, then creates and updates.
	pub(super) async fn reconcile(&mut self) {
		let roots = self.plan_removals();
		let reapply = self.take_down(&roots, &HashSet::new()).await;

		let mut apply = self
			.working
			.iter()
			.filter(|key| {
				self.graph.get(key).is_some_and(|node| {
					node.desired.is_some()
						&& !matches!(
							node.state,
							ValueState::Invalid | ValueState::Unimplemented
						)
				})
			})
			.cloned()
			.collect::<Vec<_>>();

		for key in reapply {
			if !apply.contains(&key) {
				apply.push(key);
			}
		}

		let revalidate = self.revalidate_only(&apply);
		self.apply_all(apply, revalidate).await;
	}

	/// Pending values outside of the working set that depend on it, transitively.
	///
	/// They only take part in cycle detection. Once their dependencies are applied the retry
	/// loop takes care of them.
	fn revalidate_only(&self, apply: &[Key]) -> Vec<Key> {
		let mut seen = apply.iter().cloned().collect::<HashSet<_>>();
		let mut frontier = apply.to_vec();
		let mut revalidate = Vec::new();

		while !frontier.is_empty() {
			let added = self
				.graph
				.nodes()
				.filter(|node| {
					node.state == ValueState::Pending
						&& node.desired.is_some()
						&& !seen.contains(&node.key)
						&& !self.in_working.contains(&node.key)
				})
				.filter(|node| {
					node.desired_deps
						.iter()
						.any(|dep| frontier.iter().any(|key| dep.matches(key)))
				})
				.map(|node| node.key.clone())
				.collect::<Vec<_>>();

			seen.extend(added.iter().cloned());
			revalidate.extend(added.iter().cloned());
			frontier = added;
		}

		if !revalidate.is_empty() {
			trace!(txn_seq = self.seq, ?revalidate, "Pending dependents pulled in for revalidation");
		}

		revalidate
	}

	/// Roots of the removal phase: undesired unprotected values, invalid replacements and
	/// values that change in a way that requires recreation.
	fn plan_removals(&mut self) -> Vec<Key> {
		let mut roots = Vec::new();

		for key in &self.working {
			let Some(node) = self.graph.get(key) else {
				continue;
			};
			let Some(applied) = &node.applied else {
				continue;
			};

			let remove = match &node.desired {
				_ if node.state == ValueState::Invalid => true,
				None => !node.is_protected(),
				Some(desired) => node
					.descriptor
					.as_deref()
					.and_then(|name| self.registry.get(name))
					.is_some_and(|descriptor| {
						!descriptor.equivalent_values(key, applied.as_ref(), desired.as_ref())
							&& descriptor.update_with_recreate(
								key,
								applied.as_ref(),
								desired.as_ref(),
								node.metadata.as_ref(),
							)
					}),
			};

			if remove {
				if node.desired.is_some() && node.state != ValueState::Invalid {
					self.recreating.insert(key.clone());
				}
				roots.push(key.clone());
			}
		}

		roots
	}

	/// Removes `roots` together with everything that depends on them, dependents first.
	///
	/// Keys in `skip_calls` are already gone from the forwarding engine and are only removed from
	/// the graph. Returns the removed keys that are still desired, to be applied again.
	async fn take_down(&mut self, roots: &[Key], skip_calls: &HashSet<Key>) -> Vec<Key> {
		if roots.is_empty() {
			return Vec::new();
		}

		let order = self.graph.removal_closure(roots);
		let mut failed = Vec::<Key>::new();
		let mut reapply = Vec::new();

		for key in order {
			let Some(node) = self.graph.get(&key) else {
				continue;
			};
			let Some(applied) = node.applied.clone() else {
				continue;
			};

			let descriptor = node
				.descriptor
				.as_deref()
				.and_then(|name| self.registry.get(name));
			let metadata = node.metadata.clone();
			let prev_state = node.state;

			let blocker = failed
				.iter()
				.find(|failed_key| {
					self.graph.get(failed_key).is_some_and(|dependent| {
						dependent.derived_from.as_deref() == Some(key.as_str())
							|| dependent.applied_deps.iter().any(|dep| dep.matches(&key))
					})
				})
				.cloned();

			self.touch(&key);

			if let Some(by) = blocker {
				self.fail(&key, KeyError::Blocked { by });
				failed.push(key);
				continue;
			}

			let is_recreate = self.recreating.contains(&key);
			let call = descriptor.filter(|_| !skip_calls.contains(&key));

			let result = match &call {
				Some(descriptor) if !self.dry_run => {
					descriptor.delete(&key, applied.as_ref(), metadata).await
				}
				_ => Ok(()),
			};

			match result {
				Ok(()) => {
					let node = self.graph.node_mut(&key);
					node.applied = None;
					node.applied_deps.clear();
					node.metadata = None;
					node.last_update = self.seq;

					let still_desired = node.desired.is_some();
					let invalid = node.state == ValueState::Invalid;
					let parent = node.derived_from.clone();

					if let Some(descriptor) = &call {
						if descriptor.with_metadata() && !self.dry_run {
							self.metadata.remove(descriptor.name(), &key);
						}
					}

					if still_desired && !invalid {
						self.graph.node_mut(&key).state = ValueState::Pending;
						reapply.push(key.clone());
					} else if !invalid {
						self.graph.node_mut(&key).state = ValueState::Removed;
						if let Some(parent) = parent {
							if let Some(parent) = self.graph.get_mut(&parent) {
								parent.derived.remove(&key);
							}
						}
						self.set_outcome(&key, ValueStatus::Deleted);
					}

					debug!(txn_seq = self.seq, %key, is_recreate, "Value removed");

					if call.is_some() {
						self.record_op(
							&key,
							TxnOperation::Delete,
							is_recreate,
							Some(&applied),
							None,
							prev_state,
							None,
						);
					}
				}
				Err(e) => {
					warn!(txn_seq = self.seq, %key, %e, "Delete failed");
					let error = KeyError::Operation {
						operation: TxnOperation::Delete,
						error: e,
					};
					self.fail(&key, error.clone());
					self.record_op(
						&key,
						TxnOperation::Delete,
						is_recreate,
						Some(&applied),
						Some(&applied),
						prev_state,
						Some(error),
					);
					failed.push(key);
				}
			}
		}

		reapply
	}

	/// Applies `keys` dependencies first, in rounds while values taken down along the way need
	/// to be re-evaluated. `revalidate` keys are ordered with the first round, for cycle
	/// detection, but never applied.
	async fn apply_all(&mut self, mut queue: Vec<Key>, revalidate: Vec<Key>) {
		let revalidate_only = revalidate.iter().cloned().collect::<HashSet<_>>();
		let mut revalidate = Some(revalidate);
		let mut rounds = 0;

		while !queue.is_empty() {
			rounds += 1;
			if rounds > MAX_APPLY_ROUNDS {
				warn!(
					txn_seq = self.seq,
					left = queue.len(),
					"Too many apply rounds, leaving the rest pending"
				);
				for key in queue {
					self.park(&key, Vec::new());
				}
				break;
			}

			let mut candidates = queue.clone();
			candidates.extend(revalidate.take().unwrap_or_default());

			let ordering = {
				let graph = &*self.graph;
				let queued = &candidates;
				order_working_set(queued, |key| {
					graph
						.get(key)
						.map(|node| {
							node.desired_deps
								.iter()
								.flat_map(|dep| match &dep.target {
									DependencyTarget::Key(target) => vec![target.clone()],
									DependencyTarget::AnyOf(any_of) => queued
										.iter()
										.filter(|candidate| any_of.matches(candidate))
										.cloned()
										.collect(),
								})
								.collect()
						})
						.unwrap_or_default()
				})
			};

			let mut in_cycle = HashSet::new();
			for cycle in ordering.cycles {
				warn!(txn_seq = self.seq, ?cycle, "Dependency cycle");
				for key in &cycle {
					in_cycle.insert(key.clone());
					self.touch(key);
					self.fail(
						key,
						KeyError::Cycle {
							cycle: cycle.clone(),
						},
					);
				}
			}

			let mut next = Vec::new();
			for key in ordering.order {
				if in_cycle.contains(&key) || revalidate_only.contains(&key) {
					continue;
				}

				for extra in self.apply_one(&key).await {
					if !next.contains(&extra) {
						next.push(extra);
					}
				}
			}

			queue = next;
		}
	}

	/// Brings one desired value to the forwarding engine, or parks it.
	async fn apply_one(&mut self, key: &str) -> Vec<Key> {
		let Some(node) = self.graph.get(key) else {
			return Vec::new();
		};
		let Some(desired) = node.desired.clone() else {
			return Vec::new();
		};
		if matches!(
			node.state,
			ValueState::Invalid | ValueState::Unimplemented
		) {
			return Vec::new();
		}

		let unmet = self
			.graph
			.unmet(&node.desired_deps)
			.into_iter()
			.cloned()
			.collect::<Vec<_>>();
		let descriptor = node
			.descriptor
			.as_deref()
			.and_then(|name| self.registry.get(name));
		let applied = node.applied.clone();

		self.touch(key);

		if self.interrupted.load(Ordering::Acquire) {
			self.park(key, Vec::new());
			return Vec::new();
		}

		if !unmet.is_empty() {
			let mut extra = Vec::new();
			if applied.is_some() {
				// The new version of the value needs something that is not there.
				extra = self.take_down(&[key.to_string()], &HashSet::new()).await;
				extra.retain(|other| other != key);
			}
			self.park(key, unmet);
			return extra;
		}

		let Some(descriptor) = descriptor else {
			self.apply_property(key, desired, applied);
			return Vec::new();
		};

		let mut extra = Vec::new();

		if let Some(applied) = applied {
			if descriptor.equivalent_values(key, applied.as_ref(), desired.as_ref()) {
				self.mark_applied(key, desired, None);
				self.set_outcome(key, ValueStatus::Skipped);
				return Vec::new();
			}

			let metadata = self
				.graph
				.get(key)
				.and_then(|node| node.metadata.clone());

			if !descriptor.update_with_recreate(
				key,
				applied.as_ref(),
				desired.as_ref(),
				metadata.as_ref(),
			) {
				self.update(&descriptor, key, applied, desired, metadata)
					.await;
				return Vec::new();
			}

			self.recreating.insert(key.to_string());
			extra = self.take_down(&[key.to_string()], &HashSet::new()).await;
			extra.retain(|other| other != key);

			if self.graph.is_applied(key) {
				// delete failed
				return extra;
			}
		}

		self.create(&descriptor, key, desired).await;
		extra
	}

	async fn create(&mut self, descriptor: &Arc<dyn Descriptor>, key: &str, desired: SharedValue) {
		let prev_state = self
			.graph
			.get(key)
			.map_or(ValueState::NonExistent, |node| node.state);
		let is_recreate = self.recreating.contains(key);

		let result = if self.dry_run {
			Ok(None)
		} else {
			descriptor.create(key, desired.as_ref()).await
		};

		match result {
			Ok(metadata) => {
				if let Some(metadata) = &metadata {
					if descriptor.with_metadata() && !self.dry_run {
						self.metadata
							.put(descriptor.name(), key, Arc::clone(metadata));
					}
				}

				self.mark_applied(key, Arc::clone(&desired), metadata);
				self.newly_applied.push(key.to_string());
				self.origins.push((key.to_string(), Origin::Northbound));

				let status = if self.was_applied(key) {
					ValueStatus::Updated
				} else {
					ValueStatus::Applied
				};
				debug!(txn_seq = self.seq, %key, descriptor = descriptor.name(), is_recreate, "Value created");
				self.set_outcome(key, status);
				self.record_op(
					key,
					TxnOperation::Create,
					is_recreate,
					None,
					Some(&desired),
					prev_state,
					None,
				);
			}
			Err(e) => {
				warn!(txn_seq = self.seq, %key, descriptor = descriptor.name(), %e, "Create failed");
				let error = KeyError::Operation {
					operation: TxnOperation::Create,
					error: e,
				};
				self.fail(key, error.clone());
				self.record_op(
					key,
					TxnOperation::Create,
					is_recreate,
					None,
					Some(&desired),
					prev_state,
					Some(error),
				);
			}
		}
	}

	async fn update(
		&mut self,
		descriptor: &Arc<dyn Descriptor>,
		key: &str,
		applied: SharedValue,
		desired: SharedValue,
		metadata: Option<SharedMetadata>,
	) {
		let prev_state = self
			.graph
			.get(key)
			.map_or(ValueState::NonExistent, |node| node.state);

		let result = if self.dry_run {
			Ok(metadata)
		} else {
			descriptor
				.update(key, applied.as_ref(), desired.as_ref(), metadata)
				.await
		};

		match result {
			Ok(metadata) => {
				if let Some(metadata) = &metadata {
					if descriptor.with_metadata() && !self.dry_run {
						self.metadata
							.put(descriptor.name(), key, Arc::clone(metadata));
					}
				}

				self.mark_applied(key, Arc::clone(&desired), metadata);
				debug!(txn_seq = self.seq, %key, descriptor = descriptor.name(), "Value updated");
				self.set_outcome(key, ValueStatus::Updated);
				self.record_op(
					key,
					TxnOperation::Update,
					false,
					Some(&applied),
					Some(&desired),
					prev_state,
					None,
				);
			}
			Err(e) => {
				warn!(txn_seq = self.seq, %key, descriptor = descriptor.name(), %e, "Update failed");
				let error = KeyError::Operation {
					operation: TxnOperation::Update,
					error: e,
				};
				self.fail(key, error.clone());
				self.record_op(
					key,
					TxnOperation::Update,
					false,
					Some(&applied),
					Some(&desired),
					prev_state,
					Some(error),
				);
			}
		}
	}

	/// Derived values without a descriptor exist as soon as their dependencies do.
	fn apply_property(&mut self, key: &str, desired: SharedValue, applied: Option<SharedValue>) {
		let unchanged = applied
			.as_ref()
			.is_some_and(|applied| applied.dyn_eq(desired.as_ref()));

		self.mark_applied(key, desired, None);

		let status = if unchanged {
			ValueStatus::Skipped
		} else if self.was_applied(key) {
			ValueStatus::Updated
		} else {
			ValueStatus::Applied
		};

		if applied.is_none() {
			self.newly_applied.push(key.to_string());
		}
		trace!(txn_seq = self.seq, %key, "Property applied");
		self.set_outcome(key, status);
	}

	/// Records a successful create, update or equivalence check.
	fn mark_applied(&mut self, key: &str, desired: SharedValue, metadata: Option<SharedMetadata>) {
		let seq = self.seq;
		let node = self.graph.node_mut(key);

		node.applied = Some(desired);
		node.applied_deps = node.desired_deps.clone();
		if metadata.is_some() {
			node.metadata = metadata;
		}
		node.origin = Origin::Northbound;
		node.state = ValueState::Configured;
		node.error = None;
		node.unmet.clear();
		node.last_update = seq;
	}

	fn park(&mut self, key: &str, unmet: Vec<Dependency>) {
		let labels = unmet.iter().map(ToString::to_string).collect::<Vec<_>>();

		let node = self.graph.node_mut(key);
		node.state = ValueState::Pending;
		node.unmet.clone_from(&labels);
		node.last_update = self.seq;

		trace!(txn_seq = self.seq, %key, ?labels, "Value pending");
		self.set_outcome(key, ValueStatus::Pending(labels));
	}

	/// Change notified by the forwarding engine: no descriptor is called for the value itself.
	pub(super) async fn notify(
		&mut self,
		key: &str,
		value: Option<SharedValue>,
		metadata: Option<SharedMetadata>,
	) {
		let descriptor = match self.registry.descriptor_for_key(key) {
			Ok(descriptor) => descriptor,
			Err(e) => {
				warn!(%key, %e, "Ignoring notification for an ambiguous key");
				return;
			}
		};

		if let Some(node) = self.graph.get(key) {
			if node.desired.is_some() || node.derived_from.is_some() {
				debug!(%key, "Ignoring notification for a northbound managed key");
				return;
			}
		}

		let Some(value) = value else {
			if !self.graph.is_applied(key) {
				return;
			}

			let mut skip_calls = self
				.graph
				.get(key)
				.map(|node| node.derived.iter().cloned().collect::<HashSet<_>>())
				.unwrap_or_default();
			skip_calls.insert(key.to_string());

			let reapply = self.take_down(&[key.to_string()], &skip_calls).await;
			self.apply_all(reapply, Vec::new()).await;
			return;
		};

		self.touch(key);

		if let (Some(descriptor), Some(metadata)) = (&descriptor, &metadata) {
			if descriptor.with_metadata() {
				self.metadata
					.put(descriptor.name(), key, Arc::clone(metadata));
			}
		}

		let (deps, derived) = descriptor.as_ref().map_or_else(Default::default, |d| {
			(
				d.dependencies(key, value.as_ref()),
				d.derived_values(key, value.as_ref()),
			)
		});

		let node = self.graph.node_mut(key);
		node.descriptor = descriptor.as_ref().map(|d| d.name().to_string());
		node.applied = Some(value);
		node.applied_deps = deps;
		if metadata.is_some() {
			node.metadata = metadata;
		}
		node.origin = Origin::Southbound;
		node.state = ValueState::Obtained;
		node.error = None;
		node.last_update = self.seq;

		self.newly_applied.push(key.to_string());
		self.origins.push((key.to_string(), Origin::Southbound));
		self.set_outcome(key, ValueStatus::Applied);

		for (derived_key, newly) in adopt_derived(
			self.graph,
			self.registry,
			key,
			Origin::Southbound,
			derived,
			self.seq,
		) {
			self.touch(&derived_key);
			if newly {
				self.newly_applied.push(derived_key.clone());
			}
			self.set_outcome(&derived_key, ValueStatus::Applied);
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn record_op(
		&mut self,
		key: &str,
		operation: TxnOperation,
		is_recreate: bool,
		prev_value: Option<&SharedValue>,
		new_value: Option<&SharedValue>,
		prev_state: ValueState,
		error: Option<KeyError>,
	) {
		let (derived_from, new_state) = self
			.graph
			.get(key)
			.map_or((None, ValueState::NonExistent), |node| {
				(node.derived_from.clone(), node.state)
			});

		self.executed.push(RecordedOp {
			key: key.to_string(),
			derived_from,
			operation,
			is_recreate,
			prev_value: render(prev_value),
			new_value: render(new_value),
			prev_state,
			new_state,
			error,
		});
	}
}

/// Records derived values of an applied value that was not created by the scheduler (retrieved
/// or notified). Returns the derived keys with whether they were not applied before.
pub(super) fn adopt_derived(
	graph: &mut Graph,
	registry: &Registry,
	parent: &str,
	origin: Origin,
	items: Vec<KeyValuePair>,
	seq: u64,
) -> Vec<(Key, bool)> {
	let keep = items
		.iter()
		.map(|kv| kv.key.clone())
		.collect::<BTreeSet<_>>();

	let stale = graph
		.get(parent)
		.map(|node| {
			node.derived
				.difference(&keep)
				.cloned()
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();

	for key in stale {
		if let Some(node) = graph.get_mut(&key) {
			node.applied = None;
			node.applied_deps.clear();
			node.last_update = seq;
			if node.desired.is_none() {
				node.state = ValueState::Removed;
				graph.node_mut(parent).derived.remove(&key);
			}
		}
	}

	let mut adopted = Vec::with_capacity(items.len());

	for KeyValuePair { key, value } in items {
		let descriptor = registry.descriptor_for_key(&key).ok().flatten();

		let mut deps = descriptor
			.as_ref()
			.map(|descriptor| descriptor.dependencies(&key, value.as_ref()))
			.unwrap_or_default();
		deps.push(Dependency::on(DERIVED_FROM, parent));

		graph.node_mut(parent).derived.insert(key.clone());

		let node = graph.node_mut(&key);
		let newly = !node.is_applied();
		node.derived_from = Some(parent.to_string());
		node.descriptor = descriptor.as_ref().map(|d| d.name().to_string());
		node.applied = Some(value);
		node.applied_deps = deps;
		node.origin = origin;
		if node.desired.is_none() {
			node.state = ValueState::Obtained;
		}
		node.last_update = seq;

		adopted.push((key, newly));
	}

	adopted
}

pub(super) fn render(value: Option<&SharedValue>) -> Option<String> {
	value.map(|value| format!("{value:?}"))
}
