#![allow(dead_code)]

use nca_scheduler::{
	cast, AnyOf, Dependency, Descriptor, Key, KeyValuePair, KvWithMetadata, Metadata,
	MetadataStore, OperationError, Origin, Registry, Scheduler, SchedulerConfig, SharedMetadata,
	ValidationError, Value,
};

use std::{
	collections::{BTreeMap, HashSet},
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Test value: a label plus whatever dependencies and derived values it should declare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
	pub text: String,
	pub deps: Vec<(String, Key)>,
	pub any_of: Vec<(String, String)>,
	pub derived: Vec<(Key, Item)>,
}

impl Item {
	pub fn new(text: &str) -> Self {
		Self {
			text: text.to_string(),
			..Default::default()
		}
	}

	pub fn depends_on(mut self, label: &str, key: &str) -> Self {
		self.deps.push((label.to_string(), key.to_string()));
		self
	}

	pub fn needs_any(mut self, label: &str, prefix: &str) -> Self {
		self.any_of.push((label.to_string(), prefix.to_string()));
		self
	}

	pub fn derives(mut self, key: &str, item: Self) -> Self {
		self.derived.push((key.to_string(), item));
		self
	}
}

#[derive(Debug)]
pub struct Handle(pub u32);

impl Metadata for Handle {
	fn handle(&self) -> Option<u32> {
		Some(self.0)
	}
}

/// In-memory forwarding engine shared by the test descriptors.
#[derive(Default)]
pub struct Southbound {
	objects: Mutex<BTreeMap<Key, (Item, Origin, u32)>>,
	ops: Mutex<Vec<String>>,
	failing: Mutex<HashSet<Key>>,
	failing_retrieve: AtomicBool,
	next_handle: AtomicU32,
	create_delay_ms: AtomicU64,
}

impl Southbound {
	fn log(&self, op: &str, key: &str) {
		self.ops.lock().push(format!("{op} {key}"));
	}

	fn check(&self, key: &str) -> Result<(), OperationError> {
		if self.failing.lock().contains(key) {
			return Err(OperationError::new(format!("injected failure for {key}")));
		}
		Ok(())
	}

	fn create(&self, key: &str, item: Item) -> Result<u32, OperationError> {
		self.log("create", key);
		self.check(key)?;

		let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
		self.objects
			.lock()
			.insert(key.to_string(), (item, Origin::Unknown, handle));

		Ok(handle)
	}

	fn update(&self, key: &str, item: Item) -> Result<(), OperationError> {
		self.log("update", key);
		self.check(key)?;

		match self.objects.lock().get_mut(key) {
			Some((current, _, _)) => {
				*current = item;
				Ok(())
			}
			None => Err(OperationError::new(format!("{key} does not exist"))),
		}
	}

	fn delete(&self, key: &str) -> Result<(), OperationError> {
		self.log("delete", key);
		self.check(key)?;

		self.objects.lock().remove(key);
		Ok(())
	}

	fn dump(&self, prefix: &str) -> Result<Vec<KvWithMetadata>, OperationError> {
		if self.failing_retrieve.load(Ordering::Relaxed) {
			return Err(OperationError::new("engine unreachable"));
		}

		Ok(self
			.objects
			.lock()
			.iter()
			.filter(|(key, _)| key.starts_with(prefix))
			.map(|(key, (item, origin, handle))| KvWithMetadata {
				key: key.clone(),
				value: Arc::new(item.clone()),
				metadata: Some(Arc::new(Handle(*handle))),
				origin: *origin,
			})
			.collect())
	}

	/// Adds an object behind the scheduler's back.
	pub fn inject(&self, key: &str, item: Item, origin: Origin) {
		let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
		self.objects
			.lock()
			.insert(key.to_string(), (item, origin, handle));
	}

	/// Removes an object behind the scheduler's back.
	pub fn vanish(&self, key: &str) {
		self.objects.lock().remove(key);
	}

	pub fn contains(&self, key: &str) -> bool {
		self.objects.lock().contains_key(key)
	}

	pub fn fail_on(&self, key: &str) {
		self.failing.lock().insert(key.to_string());
	}

	pub fn heal(&self, key: &str) {
		self.failing.lock().remove(key);
	}

	/// Every create takes at least `delay` from now on.
	pub fn slow_down(&self, delay: Duration) {
		self.create_delay_ms
			.store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
	}

	fn create_delay(&self) -> Duration {
		Duration::from_millis(self.create_delay_ms.load(Ordering::Relaxed))
	}

	pub fn fail_retrieve(&self, fail: bool) {
		self.failing_retrieve.store(fail, Ordering::Relaxed);
	}

	pub fn ops(&self) -> Vec<String> {
		self.ops.lock().clone()
	}

	pub fn take_ops(&self) -> Vec<String> {
		std::mem::take(&mut *self.ops.lock())
	}
}

pub struct TestDescriptor {
	name: String,
	prefix: String,
	sb: Arc<Southbound>,
	update: bool,
	retrieve: bool,
	retrieve_after: Vec<String>,
}

impl TestDescriptor {
	pub fn new(name: &str, prefix: &str, sb: &Arc<Southbound>) -> Self {
		Self {
			name: name.to_string(),
			prefix: prefix.to_string(),
			sb: Arc::clone(sb),
			update: false,
			retrieve: false,
			retrieve_after: Vec::new(),
		}
	}

	pub fn with_update(mut self) -> Self {
		self.update = true;
		self
	}

	pub fn with_retrieve(mut self) -> Self {
		self.retrieve = true;
		self
	}

	pub fn retrieve_after(mut self, name: &str) -> Self {
		self.retrieve_after.push(name.to_string());
		self
	}
}

fn item(value: &dyn Value) -> Result<Item, OperationError> {
	cast::<Item>(value)
		.cloned()
		.ok_or_else(|| OperationError::new("unexpected value type"))
}

#[async_trait]
impl Descriptor for TestDescriptor {
	fn name(&self) -> &str {
		&self.name
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(&self.prefix)
	}

	fn with_metadata(&self) -> bool {
		true
	}

	fn validate(&self, _key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let item = cast::<Item>(value).ok_or_else(|| ValidationError::new("unexpected value type"))?;

		if item.text.is_empty() {
			return Err(ValidationError::new("text must not be empty").with_field("text"));
		}

		Ok(())
	}

	async fn create(
		&self,
		key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let item = item(value)?;

		let delay = self.sb.create_delay();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let handle = self.sb.create(key, item)?;
		Ok(Some(Arc::new(Handle(handle))))
	}

	fn supports_update(&self) -> bool {
		self.update
	}

	async fn update(
		&self,
		key: &str,
		_old: &dyn Value,
		new: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<Option<SharedMetadata>, OperationError> {
		self.sb.update(key, item(new)?)?;
		Ok(metadata)
	}

	async fn delete(
		&self,
		key: &str,
		_value: &dyn Value,
		_metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError> {
		self.sb.delete(key)
	}

	fn supports_retrieve(&self) -> bool {
		self.retrieve
	}

	async fn retrieve(
		&self,
		_correlate: &[KvWithMetadata],
	) -> Result<Vec<KvWithMetadata>, OperationError> {
		self.sb.dump(&self.prefix)
	}

	fn retrieve_dependencies(&self) -> Vec<String> {
		self.retrieve_after.clone()
	}

	fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
		let Some(item) = cast::<Item>(value) else {
			return Vec::new();
		};

		item.deps
			.iter()
			.map(|(label, key)| Dependency::on(label.as_str(), key.as_str()))
			.chain(item.any_of.iter().map(|(label, prefix)| {
				Dependency::any_of(
					label.as_str(),
					AnyOf {
						key_prefixes: vec![prefix.clone()],
						selector: None,
					},
				)
			}))
			.collect()
	}

	fn derived_values(&self, _key: &str, value: &dyn Value) -> Vec<KeyValuePair> {
		cast::<Item>(value)
			.map(|item| {
				item.derived
					.iter()
					.map(|(key, derived)| KeyValuePair::new(key.as_str(), derived.clone()))
					.collect()
			})
			.unwrap_or_default()
	}
}

pub fn test_config() -> SchedulerConfig {
	SchedulerConfig {
		retry_merge_window_ms: 1,
		shutdown_timeout_secs: 5,
		..Default::default()
	}
}

/// Interfaces (`if/`, update in place), bridge domains (`bd/`, recreated on change) and
/// addresses (`addr/`, no retrieve).
pub fn setup() -> (Scheduler, Arc<Southbound>) {
	let sb = Arc::new(Southbound::default());

	let mut builder = Registry::builder();
	builder
		.register(
			TestDescriptor::new("interface", "if/", &sb)
				.with_update()
				.with_retrieve(),
		)
		.unwrap()
		.register(
			TestDescriptor::new("bridge-domain", "bd/", &sb)
				.with_retrieve()
				.retrieve_after("interface"),
		)
		.unwrap()
		.register(TestDescriptor::new("address", "addr/", &sb))
		.unwrap();

	let scheduler = Scheduler::new(builder.build().unwrap(), MetadataStore::new(), test_config());

	(scheduler, sb)
}
