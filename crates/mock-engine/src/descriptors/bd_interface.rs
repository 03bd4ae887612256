use std::sync::Arc;

use async_trait::async_trait;
use nca_scheduler::{
	Dependency, Descriptor, MetadataStore, OperationError, SharedMetadata, Value,
};
use tracing::debug;

use crate::{
	engine::MockEngine,
	model::{bridge_domain_key, interface_key, parse_bd_interface_key, BdInterface},
};

use super::{bd_id, sw_if_index, typed, BD_INTERFACE};

/// `bd/<bd>/interface/<interface>`, derived from bridge domains only.
///
/// Changing the BVI flag recreates the binding.
pub struct BdInterfaceDescriptor {
	engine: Arc<MockEngine>,
	metadata: MetadataStore,
}

impl BdInterfaceDescriptor {
	#[must_use]
	pub const fn new(engine: Arc<MockEngine>, metadata: MetadataStore) -> Self {
		Self { engine, metadata }
	}

	fn handles(&self, binding: &BdInterface) -> Result<(u32, u32), OperationError> {
		Ok((
			bd_id(&self.metadata, &binding.bridge_domain)?,
			sw_if_index(&self.metadata, &binding.name)?,
		))
	}
}

#[async_trait]
impl Descriptor for BdInterfaceDescriptor {
	fn name(&self) -> &str {
		BD_INTERFACE
	}

	fn key_selector(&self, key: &str) -> bool {
		parse_bd_interface_key(key).is_some()
	}

	async fn create(
		&self,
		_key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let binding = typed::<BdInterface>(value)?.clone();
		let (bd_id, sw_if_index) = self.handles(&binding)?;

		self.engine
			.add_bd_member(bd_id, sw_if_index, binding.bvi)
			.await?;

		debug!(bd = %binding.bridge_domain, interface = %binding.name, "Interface bound");

		Ok(None)
	}

	async fn delete(
		&self,
		_key: &str,
		value: &dyn Value,
		_metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError> {
		let binding = typed::<BdInterface>(value)?.clone();
		let (bd_id, sw_if_index) = self.handles(&binding)?;

		self.engine.remove_bd_member(bd_id, sw_if_index).await?;

		Ok(())
	}

	fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
		typed::<BdInterface>(value)
			.map(|binding| {
				vec![
					Dependency::on("interface-exists", interface_key(&binding.name)),
					Dependency::on("bridge-domain", bridge_domain_key(&binding.bridge_domain)),
				]
			})
			.unwrap_or_default()
	}
}
