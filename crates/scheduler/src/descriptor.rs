use async_trait::async_trait;

use super::{
	error::{OperationError, ValidationError},
	value::{Dependency, KeyValuePair, KvWithMetadata, SharedMetadata, Value},
};

/// The contract every configuration object type implements to be managed by the scheduler.
///
/// One instance per object type lives in the [`Registry`](crate::Registry) for the whole lifetime
/// of the process. All methods receive the key alongside the value, so a single descriptor can
/// serve a whole key family (e.g. every `if/<name>`).
///
/// Only [`name`](Descriptor::name), [`create`](Descriptor::create) and
/// [`delete`](Descriptor::delete) are mandatory, everything else has a conservative default:
/// no update support (changes are applied by recreating the object), no retrieve support, no
/// dependencies and no derived values.
#[async_trait]
pub trait Descriptor: Send + Sync + 'static {
	/// Unique name of the descriptor, also used to scope resyncs and metadata indexes.
	fn name(&self) -> &str;

	/// Fixed prefix shared by every key of this descriptor, if there is one.
	///
	/// Declared prefixes are checked for overlaps when the registry is built.
	fn key_prefix(&self) -> Option<&str> {
		None
	}

	/// Whether this descriptor is responsible for `key`.
	fn key_selector(&self, key: &str) -> bool {
		self.key_prefix()
			.is_some_and(|prefix| key.starts_with(prefix))
	}

	/// Whether values of this descriptor carry metadata to be indexed in the metadata store.
	fn with_metadata(&self) -> bool {
		false
	}

	fn validate(&self, _key: &str, _value: &dyn Value) -> Result<(), ValidationError> {
		Ok(())
	}

	async fn create(
		&self,
		key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError>;

	/// Whether [`update`](Descriptor::update) is implemented.
	fn supports_update(&self) -> bool {
		false
	}

	async fn update(
		&self,
		_key: &str,
		_old: &dyn Value,
		_new: &dyn Value,
		_metadata: Option<SharedMetadata>,
	) -> Result<Option<SharedMetadata>, OperationError> {
		Err(OperationError::new(format!(
			"descriptor <name='{}'> does not support update",
			self.name()
		)))
	}

	/// Whether a change from `old` to `new` must be carried out as delete followed by create.
	fn update_with_recreate(
		&self,
		_key: &str,
		_old: &dyn Value,
		_new: &dyn Value,
		_metadata: Option<&SharedMetadata>,
	) -> bool {
		!self.supports_update()
	}

	async fn delete(
		&self,
		key: &str,
		value: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError>;

	/// Whether [`retrieve`](Descriptor::retrieve) is implemented.
	fn supports_retrieve(&self) -> bool {
		false
	}

	/// Reads back every object of this type present in the forwarding engine.
	///
	/// `correlate` carries the values the scheduler expects to find, so that the descriptor can
	/// reconstruct fields the engine does not report back and tell apart objects it created.
	async fn retrieve(
		&self,
		_correlate: &[KvWithMetadata],
	) -> Result<Vec<KvWithMetadata>, OperationError> {
		Ok(Vec::new())
	}

	/// Names of descriptors whose values must be retrieved before this one's.
	fn retrieve_dependencies(&self) -> Vec<String> {
		Vec::new()
	}

	fn dependencies(&self, _key: &str, _value: &dyn Value) -> Vec<Dependency> {
		Vec::new()
	}

	/// Values mechanically derived from `value`. They must never derive further values.
	fn derived_values(&self, _key: &str, _value: &dyn Value) -> Vec<KeyValuePair> {
		Vec::new()
	}

	/// Defaults to structural equality of the typed values.
	fn equivalent_values(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
		old.dyn_eq(new)
	}
}
