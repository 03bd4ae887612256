use std::{fmt, sync::Arc};

use downcast_rs::{impl_downcast, DowncastSync};
use serde::{Deserialize, Serialize};

/// Unique identifier of one configuration object instance.
pub type Key = String;

/// Shared, type-erased configuration value.
pub type SharedValue = Arc<dyn Value>;

/// Shared, type-erased descriptor metadata.
pub type SharedMetadata = Arc<dyn Metadata>;

/// Predicate over keys, used for dependency selection and introspection filters.
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A trait that represents any kind of configuration payload the scheduler can carry.
///
/// Descriptors downcast it back to their concrete model type. A blanket implementation covers
/// every `PartialEq + Debug + Send + Sync` type, so plain model structs (and even `()` for
/// property values) can be scheduled without any boilerplate.
pub trait Value: DowncastSync + fmt::Debug {
	/// Structural equality against another type-erased value, used when a descriptor does not
	/// provide its own equivalence.
	fn dyn_eq(&self, other: &dyn Value) -> bool;
}

impl_downcast!(sync Value);

impl<T: PartialEq + fmt::Debug + Send + Sync + 'static> Value for T {
	fn dyn_eq(&self, other: &dyn Value) -> bool {
		other.downcast_ref::<T>().is_some_and(|other| self == other)
	}
}

/// Runtime state a descriptor attaches to a successfully created value.
///
/// Opaque to the scheduler, except for an optional numeric handle that feeds the reverse
/// lookup of the [`MetadataStore`](crate::MetadataStore).
pub trait Metadata: DowncastSync + fmt::Debug {
	fn handle(&self) -> Option<u32> {
		None
	}
}

impl_downcast!(sync Metadata);

/// Provenance of a value.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
	/// Reported by `Retrieve` without the descriptor being able to tell who created it.
	#[default]
	#[strum(serialize = "unknown")]
	Unknown,
	/// Desired by the northbound plane.
	#[strum(serialize = "from-NB")]
	Northbound,
	/// Created automatically or externally in the forwarding engine. Never removed by resync.
	#[strum(serialize = "from-SB")]
	Southbound,
}

/// Key paired with a value, as returned by [`Descriptor::derived_values`](crate::Descriptor::derived_values).
#[derive(Debug, Clone)]
pub struct KeyValuePair {
	pub key: Key,
	pub value: SharedValue,
}

impl KeyValuePair {
	pub fn new(key: impl Into<Key>, value: impl Value) -> Self {
		Self {
			key: key.into(),
			value: Arc::new(value),
		}
	}
}

/// Key-value pair with metadata and origin, exchanged with `Retrieve`.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
	pub key: Key,
	pub value: SharedValue,
	pub metadata: Option<SharedMetadata>,
	pub origin: Origin,
}

/// Precondition declared by a value: another key must be applied first.
#[derive(Clone)]
pub struct Dependency {
	/// Short human-readable label, unique within the dependencies of one value.
	pub label: String,
	pub target: DependencyTarget,
}

#[derive(Clone)]
pub enum DependencyTarget {
	/// One exact key.
	Key(Key),
	/// Any applied key selected by prefixes and/or a selector.
	AnyOf(AnyOf),
}

/// Selects a set of keys, at least one of which must be applied for the dependency to hold.
///
/// Prefixes and selector are intersected. Prefer giving prefixes: without them every key in the
/// graph is a candidate.
#[derive(Clone, Default)]
pub struct AnyOf {
	pub key_prefixes: Vec<String>,
	pub selector: Option<KeySelector>,
}

impl AnyOf {
	pub fn matches(&self, key: &str) -> bool {
		(self.key_prefixes.is_empty()
			|| self
				.key_prefixes
				.iter()
				.any(|prefix| key.starts_with(prefix.as_str())))
			&& self.selector.as_ref().map_or(true, |selector| selector(key))
	}
}

impl Dependency {
	pub fn on(label: impl Into<String>, key: impl Into<Key>) -> Self {
		Self {
			label: label.into(),
			target: DependencyTarget::Key(key.into()),
		}
	}

	pub fn any_of(label: impl Into<String>, any_of: AnyOf) -> Self {
		Self {
			label: label.into(),
			target: DependencyTarget::AnyOf(any_of),
		}
	}

	/// Whether `key` is (one of) the key(s) this dependency refers to.
	pub fn matches(&self, key: &str) -> bool {
		match &self.target {
			DependencyTarget::Key(target) => target == key,
			DependencyTarget::AnyOf(any_of) => any_of.matches(key),
		}
	}

	pub fn target_key(&self) -> Option<&str> {
		match &self.target {
			DependencyTarget::Key(target) => Some(target),
			DependencyTarget::AnyOf(_) => None,
		}
	}
}

impl fmt::Display for Dependency {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.target {
			DependencyTarget::Key(key) => write!(f, "{}:{key}", self.label),
			DependencyTarget::AnyOf(AnyOf { key_prefixes, .. }) if key_prefixes.is_empty() => {
				write!(f, "{}:<any>", self.label)
			}
			DependencyTarget::AnyOf(AnyOf { key_prefixes, .. }) => {
				write!(f, "{}:any-of[{}]", self.label, key_prefixes.join(","))
			}
		}
	}
}

impl fmt::Debug for Dependency {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Dependency({self})")
	}
}

/// Downcasts a type-erased value, for use inside descriptors.
pub fn cast<T: Value>(value: &dyn Value) -> Option<&T> {
	value.downcast_ref::<T>()
}
