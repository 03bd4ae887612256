use std::sync::Arc;

use async_trait::async_trait;
use nca_scheduler::{
	Dependency, Descriptor, KvWithMetadata, MetadataStore, OperationError, Origin,
	SharedMetadata, ValidationError, Value,
};
use tracing::warn;

use crate::{
	engine::{EngineFib, MockEngine},
	model::{
		bd_interface_key, bridge_domain_key, fib_key, is_valid_mac, same_mac, FibAction, FibEntry,
		FIB_PREFIX,
	},
};

use super::{
	bd_id, bridge_domain_name, interface_name, sw_if_index, typed, BRIDGE_DOMAIN, FIB, INTERFACE,
};

/// `fib/<bd>/<mac>`.
///
/// Forwarding entries wait for their outgoing interface to be bound into the bridge domain, not
/// merely to exist.
pub struct FibDescriptor {
	engine: Arc<MockEngine>,
	metadata: MetadataStore,
}

impl FibDescriptor {
	#[must_use]
	pub const fn new(engine: Arc<MockEngine>, metadata: MetadataStore) -> Self {
		Self { engine, metadata }
	}
}

#[async_trait]
impl Descriptor for FibDescriptor {
	fn name(&self) -> &str {
		FIB
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(FIB_PREFIX)
	}

	fn validate(&self, key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let fib = typed::<FibEntry>(value).map_err(|e| ValidationError::new(e.0))?;

		if !is_valid_mac(&fib.mac) {
			return Err(
				ValidationError::new(format!("invalid mac <mac='{}'>", fib.mac)).with_field("mac"),
			);
		}
		if fib.action == FibAction::Forward && fib.outgoing_interface.is_none() {
			return Err(ValidationError::new("forwarding entry without outgoing interface")
				.with_field("outgoing_interface"));
		}
		if key != fib_key(&fib.bridge_domain, &fib.mac) {
			return Err(ValidationError::new(format!(
				"entry doesn't belong under <key='{key}'>"
			))
			.with_field("bridge_domain")
			.with_field("mac"));
		}

		Ok(())
	}

	async fn create(
		&self,
		_key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let fib = typed::<FibEntry>(value)?.clone();

		let sw_if_index = match &fib.outgoing_interface {
			Some(interface) => Some(sw_if_index(&self.metadata, interface)?),
			None => None,
		};

		self.engine
			.add_fib(EngineFib {
				bd_id: bd_id(&self.metadata, &fib.bridge_domain)?,
				mac: fib.mac.to_lowercase(),
				action: fib.action,
				sw_if_index,
				bvi: fib.bvi,
				is_static: fib.is_static,
			})
			.await?;

		Ok(None)
	}

	async fn delete(
		&self,
		_key: &str,
		value: &dyn Value,
		_metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError> {
		let fib = typed::<FibEntry>(value)?.clone();

		self.engine
			.delete_fib(
				bd_id(&self.metadata, &fib.bridge_domain)?,
				&fib.mac.to_lowercase(),
			)
			.await?;

		Ok(())
	}

	fn supports_retrieve(&self) -> bool {
		true
	}

	async fn retrieve(
		&self,
		_correlate: &[KvWithMetadata],
	) -> Result<Vec<KvWithMetadata>, OperationError> {
		let mut retrieved = Vec::new();

		for fib in self.engine.dump_fibs().await? {
			let Some(bridge_domain) = bridge_domain_name(&self.metadata, fib.bd_id) else {
				warn!(bd_id = fib.bd_id, mac = %fib.mac, "FIB entry in unknown bridge domain, ignoring");
				continue;
			};
			let outgoing_interface = match fib.sw_if_index {
				Some(sw_if_index) => match interface_name(&self.metadata, sw_if_index) {
					Some(name) => Some(name),
					None => {
						warn!(sw_if_index, mac = %fib.mac, "FIB entry to unknown interface, ignoring");
						continue;
					}
				},
				None => None,
			};

			retrieved.push(KvWithMetadata {
				key: fib_key(&bridge_domain, &fib.mac),
				value: Arc::new(FibEntry {
					bridge_domain,
					mac: fib.mac,
					action: fib.action,
					outgoing_interface,
					bvi: fib.bvi,
					is_static: fib.is_static,
				}),
				metadata: None,
				origin: Origin::Unknown,
			});
		}

		Ok(retrieved)
	}

	fn retrieve_dependencies(&self) -> Vec<String> {
		vec![BRIDGE_DOMAIN.to_string(), INTERFACE.to_string()]
	}

	fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
		let Ok(fib) = typed::<FibEntry>(value) else {
			return Vec::new();
		};

		let mut deps = vec![Dependency::on(
			"bridge-domain",
			bridge_domain_key(&fib.bridge_domain),
		)];
		if let (FibAction::Forward, Some(interface)) = (fib.action, &fib.outgoing_interface) {
			deps.push(Dependency::on(
				"interface-in-bd",
				bd_interface_key(&fib.bridge_domain, interface),
			));
		}

		deps
	}

	fn equivalent_values(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
		match (typed::<FibEntry>(old), typed::<FibEntry>(new)) {
			(Ok(old), Ok(new)) => {
				old.bridge_domain == new.bridge_domain
					&& same_mac(&old.mac, &new.mac)
					&& old.action == new.action
					&& old.outgoing_interface == new.outgoing_interface
					&& old.bvi == new.bvi
					&& old.is_static == new.is_static
			}
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(action: FibAction, outgoing_interface: Option<&str>) -> FibEntry {
		FibEntry {
			bridge_domain: "b1".to_string(),
			mac: "AA:BB:CC:DD:EE:FF".to_string(),
			action,
			outgoing_interface: outgoing_interface.map(ToString::to_string),
			bvi: false,
			is_static: true,
		}
	}

	#[test]
	fn test_forward_needs_outgoing_interface() {
		let descriptor = FibDescriptor::new(Arc::new(MockEngine::new()), MetadataStore::new());
		let key = "fib/b1/aa:bb:cc:dd:ee:ff";

		assert_eq!(
			descriptor
				.validate(key, &entry(FibAction::Forward, None))
				.unwrap_err()
				.invalid_fields,
			vec!["outgoing_interface"]
		);
		assert!(descriptor.validate(key, &entry(FibAction::Drop, None)).is_ok());

		let deps = descriptor
			.dependencies(key, &entry(FibAction::Forward, Some("tap0")))
			.iter()
			.map(ToString::to_string)
			.collect::<Vec<_>>();
		assert_eq!(
			deps,
			vec!["bridge-domain:bd/b1", "interface-in-bd:bd/b1/interface/tap0"]
		);
	}
}
