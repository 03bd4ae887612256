use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
	executor::{adopt_derived, Executor},
	graph::ValueState,
	txn::{RetrieveFailure, TxnItem},
	value::{KvWithMetadata, Origin},
};

/// How much of the southbound state a resync reads back before reconciling.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResyncStrategy {
	/// No retrieve, reconcile against what the scheduler believes is applied.
	Skip,
	/// Retrieve only descriptors whose desired values changed since their last retrieve.
	Optimized,
	/// Retrieve every descriptor that supports it.
	#[default]
	Full,
}

#[derive(Debug, Default)]
pub(crate) struct Refreshed {
	pub(crate) failures: Vec<RetrieveFailure>,
	/// Descriptors whose keys must be left untouched.
	pub(crate) failed: HashSet<String>,
}

impl Executor {
	/// Marks descriptors whose desired values a snapshot changes, for `Optimized` refreshes.
	pub(crate) fn mark_snapshot_changes(&mut self, items: &[TxnItem]) {
		let mut listed = HashSet::with_capacity(items.len());

		for item in items {
			listed.insert(item.key.as_str());

			let Ok(Some(descriptor)) = self.registry.descriptor_for_key(&item.key) else {
				continue;
			};

			let unchanged = match (
				self.graph.get(&item.key).and_then(|node| node.desired.as_ref()),
				&item.value,
			) {
				(Some(old), Some(new)) => {
					descriptor.equivalent_values(&item.key, old.as_ref(), new.as_ref())
				}
				(None, None) => true,
				_ => false,
			};

			if !unchanged {
				self.dirty.insert(descriptor.name().to_string());
			}
		}

		let omitted = self
			.graph
			.nodes()
			.filter(|node| node.derived_from.is_none() && node.desired.is_some())
			.filter(|node| !listed.contains(node.key.as_str()))
			.filter_map(|node| node.descriptor.clone())
			.collect::<Vec<_>>();

		self.dirty.extend(omitted);
	}

	/// Reads back the southbound state of the selected descriptors, in retrieve order.
	///
	/// `snapshot` correlates the very first refresh, when the graph does not know yet what the
	/// northbound plane wants.
	pub(crate) async fn refresh(
		&mut self,
		strategy: ResyncStrategy,
		scope: Option<&HashSet<String>>,
		snapshot: Option<&[TxnItem]>,
	) -> Refreshed {
		let mut refreshed = Refreshed::default();

		if strategy == ResyncStrategy::Skip {
			return refreshed;
		}

		let first = !self.resynced;
		let selected = self
			.registry
			.retrieve_order()
			.iter()
			.filter(|name| scope.map_or(true, |scope| scope.contains(*name)))
			.filter(|name| {
				strategy == ResyncStrategy::Full || first || self.dirty.contains(*name)
			})
			.filter_map(|name| self.registry.get(name))
			.filter(|descriptor| descriptor.supports_retrieve())
			.collect::<Vec<_>>();

		info!(
			%strategy,
			descriptors = selected.len(),
			first,
			"Refreshing southbound state"
		);

		for descriptor in selected {
			let name = descriptor.name().to_string();

			let correlate = match snapshot {
				Some(items) if first => items
					.iter()
					.filter(|item| descriptor.key_selector(&item.key))
					.filter_map(|item| {
						item.value.clone().map(|value| KvWithMetadata {
							key: item.key.clone(),
							value,
							metadata: None,
							origin: Origin::Northbound,
						})
					})
					.collect::<Vec<_>>(),
				_ => self
					.graph
					.base_keys_of(&name)
					.into_iter()
					.filter_map(|key| {
						let node = self.graph.get(&key)?;
						let value = node.desired.clone().or_else(|| node.applied.clone())?;
						Some(KvWithMetadata {
							key,
							value,
							metadata: node.metadata.clone(),
							origin: if node.desired.is_some() {
								Origin::Northbound
							} else {
								node.origin
							},
						})
					})
					.collect(),
			};

			let retrieved = match descriptor.retrieve(&correlate).await {
				Ok(retrieved) => retrieved,
				Err(e) => {
					warn!(descriptor = %name, %e, "Retrieve failed, leaving its values untouched");
					refreshed.failed.insert(name.clone());
					refreshed.failures.push(RetrieveFailure {
						descriptor: name,
						error: e,
					});
					continue;
				}
			};

			let northbound = correlate
				.iter()
				.filter(|kv| kv.origin == Origin::Northbound)
				.map(|kv| kv.key.clone())
				.collect::<HashSet<_>>();

			let mut seen = HashSet::with_capacity(retrieved.len());

			for KvWithMetadata {
				key,
				value,
				metadata,
				origin,
			} in retrieved
			{
				match self.registry.descriptor_for_key(&key) {
					Ok(Some(owner)) if owner.name() == name => {}
					_ => {
						warn!(descriptor = %name, %key, "Retrieved key not claimed by the descriptor, ignoring");
						continue;
					}
				}

				if !seen.insert(key.clone()) {
					warn!(descriptor = %name, %key, "Key retrieved twice, ignoring the duplicate");
					continue;
				}

				let origin = match origin {
					Origin::Unknown if northbound.contains(&key) => Origin::Northbound,
					Origin::Unknown => self
						.last_origin
						.get(&key)
						.copied()
						.unwrap_or(Origin::Unknown),
					origin => origin,
				};

				if let Some(metadata) = &metadata {
					if descriptor.with_metadata() {
						self.metadata.put(&name, &key, metadata.clone());
					}
				}

				let deps = descriptor.dependencies(&key, value.as_ref());
				let derived = descriptor.derived_values(&key, value.as_ref());

				let node = self.graph.node_mut(&key);
				node.descriptor = Some(name.clone());
				node.applied = Some(value);
				node.applied_deps = deps;
				node.origin = origin;
				if metadata.is_some() {
					node.metadata = metadata;
				}
				if node.desired.is_none() {
					node.state = ValueState::Obtained;
				}

				self.last_origin.insert(key.clone(), origin);
				adopt_derived(&mut self.graph, &self.registry, &key, origin, derived, self.seq);
			}

			for key in self.graph.base_keys_of(&name) {
				if seen.contains(&key) || !self.graph.is_applied(&key) {
					continue;
				}

				debug!(descriptor = %name, %key, "Value no longer present in the forwarding engine");

				if descriptor.with_metadata() {
					self.metadata.remove(&name, &key);
				}

				let derived = self
					.graph
					.get(&key)
					.map(|node| node.derived.iter().cloned().collect::<Vec<_>>())
					.unwrap_or_default();

				for key in derived.iter().chain([&key]) {
					if let Some(node) = self.graph.get_mut(key) {
						node.applied = None;
						node.applied_deps.clear();
						node.metadata = None;
						if node.desired.is_none() {
							node.state = ValueState::Removed;
						}
					}
				}

				if let Some(node) = self.graph.get_mut(&key) {
					if node.desired.is_none() {
						node.derived.clear();
					}
				}
			}

			self.dirty.remove(&name);
		}

		self.resynced = true;
		refreshed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_strategy_names() {
		assert_eq!(ResyncStrategy::Optimized.to_string(), "optimized");
		assert_eq!(
			serde_json::from_str::<ResyncStrategy>(r#""skip""#).unwrap(),
			ResyncStrategy::Skip
		);
		assert_eq!(ResyncStrategy::default(), ResyncStrategy::Full);
	}
}
