use std::sync::Arc;

use async_trait::async_trait;
use nca_scheduler::{
	Dependency, Descriptor, KvWithMetadata, MetadataStore, OperationError, Origin,
	SharedMetadata, ValidationError, Value,
};
use tracing::warn;

use crate::{
	engine::MockEngine,
	model::{interface_key, xconnect_key, XConnect, XCONNECT_PREFIX},
};

use super::{interface_name, sw_if_index, typed, INTERFACE, XCONNECT};

/// `xconnect/<rx>`: everything received on `rx` is sent out of `tx`.
pub struct XConnectDescriptor {
	engine: Arc<MockEngine>,
	metadata: MetadataStore,
}

impl XConnectDescriptor {
	#[must_use]
	pub const fn new(engine: Arc<MockEngine>, metadata: MetadataStore) -> Self {
		Self { engine, metadata }
	}
}

#[async_trait]
impl Descriptor for XConnectDescriptor {
	fn name(&self) -> &str {
		XCONNECT
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(XCONNECT_PREFIX)
	}

	fn validate(&self, key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let xconnect = typed::<XConnect>(value).map_err(|e| ValidationError::new(e.0))?;

		if xconnect.rx == xconnect.tx {
			return Err(ValidationError::new("interface cross-connected to itself").with_field("tx"));
		}
		if key != xconnect_key(&xconnect.rx) {
			return Err(
				ValidationError::new(format!("xconnect doesn't belong under <key='{key}'>"))
					.with_field("rx"),
			);
		}

		Ok(())
	}

	async fn create(
		&self,
		_key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let xconnect = typed::<XConnect>(value)?;
		let (rx, tx) = (
			sw_if_index(&self.metadata, &xconnect.rx)?,
			sw_if_index(&self.metadata, &xconnect.tx)?,
		);

		self.engine.set_xconnect(rx, tx).await?;

		Ok(None)
	}

	fn supports_update(&self) -> bool {
		true
	}

	/// Re-pointing `tx` overwrites the existing cross-connect.
	async fn update(
		&self,
		key: &str,
		_old: &dyn Value,
		new: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<Option<SharedMetadata>, OperationError> {
		self.create(key, new).await?;

		Ok(metadata)
	}

	async fn delete(
		&self,
		_key: &str,
		value: &dyn Value,
		_metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError> {
		let rx = sw_if_index(&self.metadata, &typed::<XConnect>(value)?.rx)?;

		self.engine.delete_xconnect(rx).await?;

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

		for (rx, tx) in self.engine.dump_xconnects().await? {
			let (Some(rx), Some(tx)) = (
				interface_name(&self.metadata, rx),
				interface_name(&self.metadata, tx),
			) else {
				warn!(rx, tx, "Cross-connect between unknown interfaces, ignoring");
				continue;
			};

			retrieved.push(KvWithMetadata {
				key: xconnect_key(&rx),
				value: Arc::new(XConnect { rx, tx }),
				metadata: None,
				origin: Origin::Unknown,
			});
		}

		Ok(retrieved)
	}

	fn retrieve_dependencies(&self) -> Vec<String> {
		vec![INTERFACE.to_string()]
	}

	fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
		typed::<XConnect>(value)
			.map(|xconnect| {
				vec![
					Dependency::on("rx-interface", interface_key(&xconnect.rx)),
					Dependency::on("tx-interface", interface_key(&xconnect.tx)),
				]
			})
			.unwrap_or_default()
	}
}
