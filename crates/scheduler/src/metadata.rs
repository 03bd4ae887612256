use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::value::{Key, SharedMetadata};

#[derive(Debug, Default)]
struct MetadataIndex {
	by_key: HashMap<Key, SharedMetadata>,
	by_handle: HashMap<u32, Key>,
}

/// Per-descriptor index of runtime metadata.
///
/// Cheap to clone: every clone shares the same indexes. Readers (descriptors resolving handles of
/// other objects, introspection) may query it at any time; writes only happen from the scheduler
/// right after a successful operation or when resync adopts discovered metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
	indexes: Arc<RwLock<HashMap<String, MetadataIndex>>>,
}

impl MetadataStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn lookup_by_key(&self, descriptor: &str, key: &str) -> Option<SharedMetadata> {
		self.indexes
			.read()
			.get(descriptor)
			.and_then(|index| index.by_key.get(key))
			.cloned()
	}

	/// Reverse lookup of a numeric handle (e.g. a software interface index).
	#[must_use]
	pub fn lookup_by_handle(&self, descriptor: &str, handle: u32) -> Option<(Key, SharedMetadata)> {
		let indexes = self.indexes.read();
		let index = indexes.get(descriptor)?;
		let key = index.by_handle.get(&handle)?;

		index
			.by_key
			.get(key)
			.map(|metadata| (key.clone(), Arc::clone(metadata)))
	}

	/// Keys with metadata for the given descriptor, sorted.
	#[must_use]
	pub fn keys(&self, descriptor: &str) -> Vec<Key> {
		let mut keys = self
			.indexes
			.read()
			.get(descriptor)
			.map(|index| index.by_key.keys().cloned().collect::<Vec<_>>())
			.unwrap_or_default();

		keys.sort_unstable();
		keys
	}

	pub(crate) fn put(&self, descriptor: &str, key: &str, metadata: SharedMetadata) {
		let mut indexes = self.indexes.write();
		let index = indexes.entry(descriptor.to_string()).or_default();

		if let Some(old) = index.by_key.get(key).and_then(|old| old.handle()) {
			index.by_handle.remove(&old);
		}

		if let Some(handle) = metadata.handle() {
			if let Some(previous) = index.by_handle.insert(handle, key.to_string()) {
				if previous != key {
					warn!(
						%descriptor,
						%key,
						%previous,
						handle,
						"Metadata handle reassigned to a different key"
					);
					index.by_key.remove(&previous);
				}
			}
		}

		trace!(%descriptor, %key, "Stored metadata");
		index.by_key.insert(key.to_string(), metadata);
	}

	pub(crate) fn remove(&self, descriptor: &str, key: &str) -> Option<SharedMetadata> {
		let mut indexes = self.indexes.write();
		let index = indexes.get_mut(descriptor)?;
		let removed = index.by_key.remove(key)?;

		if let Some(handle) = removed.handle() {
			if index.by_handle.get(&handle).is_some_and(|owner| owner == key) {
				index.by_handle.remove(&handle);
			}
		}

		trace!(%descriptor, %key, "Removed metadata");
		Some(removed)
	}
}

#[cfg(test)]
mod tests {
	use crate::value::Metadata;

	use super::*;

	#[derive(Debug)]
	struct IfMeta(u32);

	impl Metadata for IfMeta {
		fn handle(&self) -> Option<u32> {
			Some(self.0)
		}
	}

	#[test]
	fn test_lookup_both_ways() {
		let store = MetadataStore::new();
		store.put("interface", "if/eth0", Arc::new(IfMeta(1)));
		store.put("interface", "if/eth1", Arc::new(IfMeta(2)));

		let (key, metadata) = store.lookup_by_handle("interface", 2).unwrap();
		assert_eq!(key, "if/eth1");
		assert_eq!(metadata.downcast_ref::<IfMeta>().unwrap().0, 2);
		assert!(store.lookup_by_key("interface", "if/eth0").is_some());
		assert!(store.lookup_by_key("bridge-domain", "if/eth0").is_none());
		assert_eq!(store.keys("interface"), vec!["if/eth0", "if/eth1"]);
	}

	#[test]
	fn test_remove_drops_reverse_entry() {
		let store = MetadataStore::new();
		store.put("interface", "if/eth0", Arc::new(IfMeta(7)));
		assert!(store.remove("interface", "if/eth0").is_some());

		assert!(store.lookup_by_handle("interface", 7).is_none());
		assert!(store.remove("interface", "if/eth0").is_none());
	}

	#[test]
	fn test_update_replaces_handle() {
		let store = MetadataStore::new();
		store.put("interface", "if/eth0", Arc::new(IfMeta(1)));
		store.put("interface", "if/eth0", Arc::new(IfMeta(5)));

		assert!(store.lookup_by_handle("interface", 1).is_none());
		assert_eq!(store.lookup_by_handle("interface", 5).unwrap().0, "if/eth0");
	}
}
