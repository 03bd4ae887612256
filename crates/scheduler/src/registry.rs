use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{descriptor::Descriptor, error::Error, order::compute_retrieve_order, value::Key};

/// Selector cache entries kept before the cache starts over.
const MAX_CACHED_KEYS: usize = 65_536;

/// Outcome of a key lookup, as remembered by the selector cache.
#[derive(Debug, Clone, Copy)]
enum Lookup {
	Found(usize),
	NotFound,
	Ambiguous(usize, usize),
}

/// Collects descriptors at startup. Built into an immutable [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
	descriptors: Vec<Arc<dyn Descriptor>>,
}

impl RegistryBuilder {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a descriptor.
	///
	/// Fails on a duplicate name, or when its declared key prefix overlaps with the prefix of an
	/// already registered descriptor.
	pub fn register(&mut self, descriptor: impl Descriptor) -> Result<&mut Self, Error> {
		self.register_arc(Arc::new(descriptor))
	}

	pub fn register_arc(&mut self, descriptor: Arc<dyn Descriptor>) -> Result<&mut Self, Error> {
		let name = descriptor.name();

		for other in &self.descriptors {
			if other.name() == name {
				return Err(Error::DuplicateDescriptor(name.to_string()));
			}

			if let (Some(prefix), Some(other_prefix)) = (descriptor.key_prefix(), other.key_prefix())
			{
				if prefix.starts_with(other_prefix) || other_prefix.starts_with(prefix) {
					return Err(Error::OverlappingPrefixes {
						first: other.name().to_string(),
						second: name.to_string(),
					});
				}
			}
		}

		debug!(descriptor = %name, "Registered descriptor");
		self.descriptors.push(descriptor);

		Ok(self)
	}

	/// Freezes the set of descriptors and computes their retrieve order.
	pub fn build(self) -> Result<Registry, Error> {
		let retrieve_deps = self
			.descriptors
			.iter()
			.map(|descriptor| descriptor.retrieve_dependencies())
			.collect::<Vec<_>>();

		let retrieve_order = compute_retrieve_order(
			self.descriptors
				.iter()
				.zip(&retrieve_deps)
				.map(|(descriptor, deps)| (descriptor.name(), deps.as_slice())),
		)?;

		let by_name = self
			.descriptors
			.iter()
			.enumerate()
			.map(|(i, descriptor)| (descriptor.name().to_string(), i))
			.collect();

		info!(
			descriptors = self.descriptors.len(),
			?retrieve_order,
			"Descriptor registry built"
		);

		Ok(Registry {
			descriptors: self.descriptors,
			by_name,
			retrieve_order,
			cache: RwLock::default(),
		})
	}
}

/// Maps keys to the descriptor that claims them.
///
/// Built once by the entry point and handed to the [`Scheduler`](crate::Scheduler). Lookups go
/// through a selector cache, so a key is matched against the selectors once while it is known
/// to the scheduler.
pub struct Registry {
	descriptors: Vec<Arc<dyn Descriptor>>,
	by_name: HashMap<String, usize>,
	retrieve_order: Vec<String>,
	cache: RwLock<HashMap<Key, Lookup>>,
}

impl Registry {
	#[must_use]
	pub fn builder() -> RegistryBuilder {
		RegistryBuilder::new()
	}

	/// Descriptor responsible for `key`, `Ok(None)` when no selector claims it.
	pub fn descriptor_for_key(&self, key: &str) -> Result<Option<Arc<dyn Descriptor>>, Error> {
		let cached = self.cache.read().get(key).copied();

		let lookup = if let Some(lookup) = cached {
			lookup
		} else {
			let lookup = self.match_selectors(key);
			let mut cache = self.cache.write();
			if cache.len() >= MAX_CACHED_KEYS {
				debug!(cached = cache.len(), "Selector cache full, clearing it");
				cache.clear();
			}
			cache.insert(key.to_string(), lookup);
			lookup
		};

		match lookup {
			Lookup::Found(i) => Ok(Some(Arc::clone(&self.descriptors[i]))),
			Lookup::NotFound => Ok(None),
			Lookup::Ambiguous(first, second) => Err(Error::OverlappingSelectors {
				key: key.to_string(),
				first: self.descriptors[first].name().to_string(),
				second: self.descriptors[second].name().to_string(),
			}),
		}
	}

	/// Drops the cached lookup of a key the scheduler no longer tracks.
	pub(crate) fn forget(&self, key: &str) {
		self.cache.write().remove(key);
	}

	#[cfg(test)]
	fn cached(&self) -> usize {
		self.cache.read().len()
	}

	fn match_selectors(&self, key: &str) -> Lookup {
		let mut matching = self
			.descriptors
			.iter()
			.enumerate()
			.filter(|(_, descriptor)| descriptor.key_selector(key))
			.map(|(i, _)| i);

		match (matching.next(), matching.next()) {
			(None, _) => Lookup::NotFound,
			(Some(i), None) => Lookup::Found(i),
			(Some(first), Some(second)) => Lookup::Ambiguous(first, second),
		}
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<Arc<dyn Descriptor>> {
		self.by_name
			.get(name)
			.map(|&i| Arc::clone(&self.descriptors[i]))
	}

	/// Descriptors in registration order.
	pub fn descriptors(&self) -> impl Iterator<Item = &Arc<dyn Descriptor>> {
		self.descriptors.iter()
	}

	/// Descriptor names ordered so that retrieve dependencies come first.
	#[must_use]
	pub fn retrieve_order(&self) -> &[String] {
		&self.retrieve_order
	}
}

impl fmt::Debug for Registry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registry")
			.field(
				"descriptors",
				&self
					.descriptors
					.iter()
					.map(|descriptor| descriptor.name())
					.collect::<Vec<_>>(),
			)
			.field("retrieve_order", &self.retrieve_order)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use crate::{
		error::OperationError,
		value::{SharedMetadata, Value},
	};

	use super::*;

	struct Prefixed {
		name: &'static str,
		prefix: Option<&'static str>,
		retrieve_deps: Vec<String>,
	}

	impl Prefixed {
		fn new(name: &'static str, prefix: &'static str) -> Self {
			Self {
				name,
				prefix: Some(prefix),
				retrieve_deps: Vec::new(),
			}
		}
	}

	#[async_trait]
	impl Descriptor for Prefixed {
		fn name(&self) -> &str {
			self.name
		}

		fn key_prefix(&self) -> Option<&str> {
			self.prefix
		}

		fn key_selector(&self, key: &str) -> bool {
			match self.prefix {
				Some(prefix) => key.starts_with(prefix),
				None => key.contains("/shared/"),
			}
		}

		fn retrieve_dependencies(&self) -> Vec<String> {
			self.retrieve_deps.clone()
		}

		async fn create(
			&self,
			_key: &str,
			_value: &dyn Value,
		) -> Result<Option<SharedMetadata>, OperationError> {
			Ok(None)
		}

		async fn delete(
			&self,
			_key: &str,
			_value: &dyn Value,
			_metadata: Option<SharedMetadata>,
		) -> Result<(), OperationError> {
			Ok(())
		}
	}

	#[test]
	fn test_duplicate_name_is_rejected() {
		let mut builder = Registry::builder();
		builder.register(Prefixed::new("interface", "if/")).unwrap();

		assert!(matches!(
			builder.register(Prefixed::new("interface", "iface/")),
			Err(Error::DuplicateDescriptor(name)) if name == "interface"
		));
	}

	#[test]
	fn test_overlapping_prefixes_are_rejected() {
		let mut builder = Registry::builder();
		builder.register(Prefixed::new("bd", "bd/")).unwrap();

		assert!(matches!(
			builder.register(Prefixed::new("bd-interface", "bd/x/")),
			Err(Error::OverlappingPrefixes { .. })
		));
	}

	#[test]
	fn test_lookup_by_key() {
		let mut builder = Registry::builder();
		builder
			.register(Prefixed::new("interface", "if/"))
			.unwrap()
			.register(Prefixed::new("route", "route/"))
			.unwrap();
		let registry = builder.build().unwrap();

		assert_eq!(
			registry.descriptor_for_key("if/eth0").unwrap().unwrap().name(),
			"interface"
		);
		// served from the cache the second time
		assert_eq!(
			registry.descriptor_for_key("if/eth0").unwrap().unwrap().name(),
			"interface"
		);
		assert!(registry.descriptor_for_key("arp/eth0/1.1.1.1").unwrap().is_none());
		assert!(registry.get("route").is_some());
	}

	#[test]
	fn test_forgotten_keys_leave_the_cache() {
		let mut builder = Registry::builder();
		builder.register(Prefixed::new("interface", "if/")).unwrap();
		let registry = builder.build().unwrap();

		registry.descriptor_for_key("if/eth0").unwrap();
		registry.descriptor_for_key("if/eth1").unwrap();
		assert_eq!(registry.cached(), 2);

		registry.forget("if/eth0");
		assert_eq!(registry.cached(), 1);

		// Still resolved, just matched again.
		assert!(registry.descriptor_for_key("if/eth0").unwrap().is_some());
	}

	#[test]
	fn test_selector_cache_is_bounded() {
		let mut builder = Registry::builder();
		builder.register(Prefixed::new("interface", "if/")).unwrap();
		let registry = builder.build().unwrap();

		for i in 0..=MAX_CACHED_KEYS {
			registry.descriptor_for_key(&format!("if/tap{i}")).unwrap();
		}

		assert!(registry.cached() <= MAX_CACHED_KEYS);
		assert_eq!(
			registry
				.descriptor_for_key(&format!("if/tap{MAX_CACHED_KEYS}"))
				.unwrap()
				.unwrap()
				.name(),
			"interface"
		);
	}

	#[test]
	fn test_ambiguous_key_is_attributed() {
		let mut builder = Registry::builder();
		builder
			.register(Prefixed::new("interface", "if/"))
			.unwrap()
			.register(Prefixed {
				name: "shared",
				prefix: None,
				retrieve_deps: Vec::new(),
			})
			.unwrap();
		let registry = builder.build().unwrap();

		assert!(matches!(
			registry.descriptor_for_key("if/shared/x"),
			Err(Error::OverlappingSelectors { key, .. }) if key == "if/shared/x"
		));
	}

	#[test]
	fn test_retrieve_order() {
		let mut builder = Registry::builder();
		builder
			.register(Prefixed {
				name: "bd",
				prefix: Some("bd/"),
				retrieve_deps: vec!["interface".to_string()],
			})
			.unwrap()
			.register(Prefixed::new("interface", "if/"))
			.unwrap();
		let registry = builder.build().unwrap();

		assert_eq!(registry.retrieve_order(), ["interface", "bd"]);
	}

	#[test]
	fn test_unknown_retrieve_dependency_is_fatal() {
		let mut builder = Registry::builder();
		builder
			.register(Prefixed {
				name: "bd",
				prefix: Some("bd/"),
				retrieve_deps: vec!["interface".to_string()],
			})
			.unwrap();

		assert!(matches!(
			builder.build(),
			Err(Error::UnknownRetrieveDependency(..))
		));
	}
}
