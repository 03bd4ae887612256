use std::{
	collections::{BTreeMap, BTreeSet, HashSet},
	ops::Bound,
};

use serde::{Deserialize, Serialize};

use super::{
	error::KeyError,
	order::order_working_set,
	value::{Dependency, DependencyTarget, Key, Origin, SharedMetadata, SharedValue},
};

/// Label of the implicit dependency every derived value has on its parent.
pub(crate) const DERIVED_FROM: &str = "derived-from";

/// Lifecycle state of a value as seen by introspection.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueState {
	/// Never seen, or forgotten.
	#[default]
	NonExistent,
	/// Desired, waiting for dependencies.
	Pending,
	/// Desired and applied.
	Configured,
	/// Present in the forwarding engine without being desired.
	Obtained,
	/// Rejected by validation.
	Invalid,
	/// Last operation failed.
	Failed,
	/// Desired, but no descriptor claims the key.
	Unimplemented,
	/// Deleted by the last transaction that touched it.
	Removed,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
	pub(crate) key: Key,
	/// Name of the descriptor, `None` for properties and unimplemented keys.
	pub(crate) descriptor: Option<String>,
	pub(crate) desired: Option<SharedValue>,
	pub(crate) desired_deps: Vec<Dependency>,
	/// What the forwarding engine holds, according to the scheduler.
	pub(crate) applied: Option<SharedValue>,
	pub(crate) applied_deps: Vec<Dependency>,
	pub(crate) metadata: Option<SharedMetadata>,
	pub(crate) origin: Origin,
	pub(crate) derived_from: Option<Key>,
	/// Derived values of the desired and of the applied value.
	pub(crate) derived: BTreeSet<Key>,
	pub(crate) state: ValueState,
	pub(crate) unmet: Vec<String>,
	pub(crate) error: Option<KeyError>,
	pub(crate) last_update: u64,
}

impl Node {
	fn new(key: Key) -> Self {
		Self {
			key,
			descriptor: None,
			desired: None,
			desired_deps: Vec::new(),
			applied: None,
			applied_deps: Vec::new(),
			metadata: None,
			origin: Origin::Unknown,
			derived_from: None,
			derived: BTreeSet::new(),
			state: ValueState::NonExistent,
			unmet: Vec::new(),
			error: None,
			last_update: 0,
		}
	}

	pub(crate) const fn is_applied(&self) -> bool {
		self.applied.is_some()
	}

	/// Managed by the northbound plane, directly or as a derived value.
	pub(crate) const fn is_managed(&self) -> bool {
		self.desired.is_some() || self.derived_from.is_some()
	}

	/// Applied, not desired, and reported as southbound-owned.
	pub(crate) fn is_protected(&self) -> bool {
		self.desired.is_none() && self.origin == Origin::Southbound
	}

	pub(crate) fn view(&self) -> ValueView {
		ValueView {
			key: self.key.clone(),
			descriptor: self.descriptor.clone(),
			value: self.desired.clone().or_else(|| self.applied.clone()),
			applied: self.applied.clone(),
			metadata: self.metadata.clone(),
			state: self.state,
			origin: self.origin,
			derived_from: self.derived_from.clone(),
			derived: self.derived.iter().cloned().collect(),
			unmet: self.unmet.clone(),
			error: self.error.clone(),
			last_update: self.last_update,
		}
	}
}

/// Read-only view of one value, published after every processed request.
#[derive(Debug, Clone, Default)]
pub struct ValueView {
	pub key: Key,
	pub descriptor: Option<String>,
	/// Desired value, or the applied one for values that are not desired.
	pub value: Option<SharedValue>,
	pub applied: Option<SharedValue>,
	pub metadata: Option<SharedMetadata>,
	pub state: ValueState,
	pub origin: Origin,
	pub derived_from: Option<Key>,
	pub derived: Vec<Key>,
	/// Unmet dependencies, formatted as `label:key`.
	pub unmet: Vec<String>,
	pub error: Option<KeyError>,
	/// Sequence number of the last transaction that changed this value.
	pub last_update: u64,
}

impl ValueView {
	pub(crate) fn non_existent(key: &str) -> Self {
		Self {
			key: key.to_string(),
			..Default::default()
		}
	}
}

/// Snapshot of the whole graph.
pub(crate) type GraphSnapshot = BTreeMap<Key, ValueView>;

#[derive(Debug, Clone, Default)]
pub(crate) struct Graph {
	nodes: BTreeMap<Key, Node>,
}

impl Graph {
	pub(crate) fn get(&self, key: &str) -> Option<&Node> {
		self.nodes.get(key)
	}

	pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
		self.nodes.get_mut(key)
	}

	pub(crate) fn node_mut(&mut self, key: &str) -> &mut Node {
		self.nodes
			.entry(key.to_string())
			.or_insert_with(|| Node::new(key.to_string()))
	}

	pub(crate) fn nodes(&self) -> impl Iterator<Item = &Node> {
		self.nodes.values()
	}

	pub(crate) fn is_applied(&self, key: &str) -> bool {
		self.nodes.get(key).is_some_and(Node::is_applied)
	}

	/// A dependency holds if a referenced key is applied and not about to be removed.
	pub(crate) fn is_satisfied(&self, dep: &Dependency, excluding: &HashSet<Key>) -> bool {
		match &dep.target {
			DependencyTarget::Key(key) => !excluding.contains(key) && self.is_applied(key),
			DependencyTarget::AnyOf(any_of) => {
				let available =
					|node: &Node| node.is_applied() && !excluding.contains(&node.key);

				if any_of.key_prefixes.is_empty() {
					return self
						.nodes
						.values()
						.any(|node| available(node) && any_of.matches(&node.key));
				}

				any_of.key_prefixes.iter().any(|prefix| {
					self.nodes
						.range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
						.take_while(|(key, _)| key.starts_with(prefix.as_str()))
						.any(|(key, node)| available(node) && any_of.matches(key))
				})
			}
		}
	}

	pub(crate) fn unmet<'d>(&self, deps: &'d [Dependency]) -> Vec<&'d Dependency> {
		let none = HashSet::new();
		deps.iter()
			.filter(|dep| !self.is_satisfied(dep, &none))
			.collect()
	}

	/// Keys of base values (not derived) claimed by the given descriptor.
	pub(crate) fn base_keys_of(&self, descriptor: &str) -> Vec<Key> {
		self.nodes
			.values()
			.filter(|node| {
				node.derived_from.is_none() && node.descriptor.as_deref() == Some(descriptor)
			})
			.map(|node| node.key.clone())
			.collect()
	}

	/// Applied values that would lose a dependency if `removed` went away.
	fn broken_dependents(&self, removed: &HashSet<Key>) -> Vec<Key> {
		self.nodes
			.values()
			.filter(|node| node.is_applied() && node.is_managed() && !removed.contains(&node.key))
			.filter(|node| {
				node.applied_deps.iter().any(|dep| {
					removed.iter().any(|key| dep.matches(key)) && !self.is_satisfied(dep, removed)
				})
			})
			.map(|node| node.key.clone())
			.collect()
	}

	/// Everything that has to be removed together with `roots`, in deletion order: dependents
	/// before their dependencies, derived values before their parent.
	///
	/// Dependents are only pulled in when they are managed by the northbound plane, values
	/// obtained from the forwarding engine are never removed on their behalf.
	pub(crate) fn removal_closure(&self, roots: &[Key]) -> Vec<Key> {
		let mut closure = HashSet::new();
		let mut ordered = roots
			.iter()
			.filter(|key| self.is_applied(key) && closure.insert((*key).clone()))
			.cloned()
			.collect::<Vec<_>>();

		loop {
			let mut added = Vec::new();

			for key in &ordered {
				if let Some(node) = self.nodes.get(key) {
					added.extend(
						node.derived
							.iter()
							.filter(|derived| self.is_applied(derived) && !closure.contains(*derived))
							.cloned(),
					);
				}
			}

			added.extend(self.broken_dependents(&closure));

			added.retain(|key| closure.insert(key.clone()));
			if added.is_empty() {
				break;
			}
			ordered.extend(added);
		}

		// A key comes after every member of the closure that depends on it.
		order_working_set(&ordered, |key| {
			self.nodes
				.values()
				.filter(|node| closure.contains(&node.key) && node.key != *key)
				.filter(|node| {
					node.derived_from.as_deref() == Some(key.as_str())
						|| node.applied_deps.iter().any(|dep| dep.matches(key))
				})
				.map(|node| node.key.clone())
				.collect()
		})
		.order
	}

	/// Drops tombstones of removed values last touched before `before_seq`, returning their keys.
	pub(crate) fn prune(&mut self, before_seq: u64) -> Vec<Key> {
		let mut pruned = Vec::new();

		self.nodes.retain(|key, node| {
			let expired = node.state == ValueState::Removed
				&& node.desired.is_none()
				&& node.applied.is_none()
				&& node.derived.is_empty()
				&& node.last_update < before_seq;
			if expired {
				pruned.push(key.clone());
			}
			!expired
		});

		pruned
	}

	pub(crate) fn snapshot(&self) -> GraphSnapshot {
		self.nodes
			.iter()
			.map(|(key, node)| (key.clone(), node.view()))
			.collect()
	}
}
