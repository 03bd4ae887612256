use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::trace;

use super::value::{Dependency, DependencyTarget, Key};

/// Values parked until their dependencies get applied.
///
/// Entries are indexed by the exact keys they wait for; entries waiting on an any-of dependency
/// are kept aside and matched against every newly applied key.
#[derive(Debug, Default)]
pub(crate) struct PendingRegistry {
	entries: BTreeMap<Key, Vec<Dependency>>,
	by_target: HashMap<Key, BTreeSet<Key>>,
	any_of: BTreeSet<Key>,
}

impl PendingRegistry {
	pub(crate) fn insert(&mut self, key: &str, unmet: Vec<Dependency>) {
		self.remove(key);

		for dep in &unmet {
			match &dep.target {
				DependencyTarget::Key(target) => {
					self.by_target
						.entry(target.clone())
						.or_default()
						.insert(key.to_string());
				}
				DependencyTarget::AnyOf(_) => {
					self.any_of.insert(key.to_string());
				}
			}
		}

		trace!(%key, unmet = unmet.len(), "Value parked as pending");
		self.entries.insert(key.to_string(), unmet);
	}

	pub(crate) fn remove(&mut self, key: &str) -> Option<Vec<Dependency>> {
		let unmet = self.entries.remove(key)?;

		for dep in &unmet {
			if let DependencyTarget::Key(target) = &dep.target {
				if let Some(waiting) = self.by_target.get_mut(target) {
					waiting.remove(key);
					if waiting.is_empty() {
						self.by_target.remove(target);
					}
				}
			}
		}
		self.any_of.remove(key);

		Some(unmet)
	}

	/// Pending keys with at least one unmet dependency referring to `key`.
	pub(crate) fn waiting_on(&self, key: &str) -> BTreeSet<Key> {
		let mut waiting = self.by_target.get(key).cloned().unwrap_or_default();

		waiting.extend(
			self.any_of
				.iter()
				.filter(|pending| {
					self.entries
						.get(*pending)
						.is_some_and(|unmet| unmet.iter().any(|dep| dep.matches(key)))
				})
				.cloned(),
		);

		waiting
	}

	pub(crate) fn contains(&self, key: &str) -> bool {
		self.entries.contains_key(key)
	}

	pub(crate) fn clear(&mut self) {
		self.entries.clear();
		self.by_target.clear();
		self.any_of.clear();
	}

	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}
}

#[cfg(test)]
mod tests {
	use crate::value::AnyOf;

	use super::*;

	#[test]
	fn test_waiting_on_exact_and_any_of() {
		let mut pending = PendingRegistry::default();
		pending.insert(
			"bd/b1",
			vec![
				Dependency::on("interface-exists", "if/if1"),
				Dependency::on("interface-exists", "if/if2"),
			],
		);
		pending.insert(
			"route/0/10.0.0.0/8/1.1.1.1",
			vec![Dependency::any_of(
				"any-address",
				AnyOf {
					key_prefixes: vec!["if/".to_string()],
					selector: None,
				},
			)],
		);

		assert_eq!(
			pending.waiting_on("if/if1").into_iter().collect::<Vec<_>>(),
			vec!["bd/b1", "route/0/10.0.0.0/8/1.1.1.1"]
		);
		assert!(pending.waiting_on("bd/b1").is_empty());
		assert_eq!(pending.len(), 2);
	}

	#[test]
	fn test_reinsert_replaces_index() {
		let mut pending = PendingRegistry::default();
		pending.insert("bd/b1", vec![Dependency::on("interface-exists", "if/if1")]);
		pending.insert("bd/b1", vec![Dependency::on("interface-exists", "if/if2")]);

		assert!(pending.waiting_on("if/if1").is_empty());
		assert!(pending.waiting_on("if/if2").contains("bd/b1"));

		pending.remove("bd/b1");
		assert!(!pending.contains("bd/b1"));
		assert!(pending.waiting_on("if/if2").is_empty());
	}
}
