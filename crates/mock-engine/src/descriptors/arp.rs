use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use nca_scheduler::{
	Dependency, Descriptor, KvWithMetadata, MetadataStore, OperationError, Origin,
	SharedMetadata, ValidationError, Value,
};
use tracing::warn;

use crate::{
	engine::{EngineArp, MockEngine},
	model::{arp_key, interface_key, is_valid_mac, same_ip, same_mac, ArpEntry, ARP_PREFIX},
};

use super::{interface_name, sw_if_index, typed, ARP, INTERFACE};

/// `arp/<interface>/<ip>`. Any change recreates the entry.
pub struct ArpDescriptor {
	engine: Arc<MockEngine>,
	metadata: MetadataStore,
}

impl ArpDescriptor {
	#[must_use]
	pub const fn new(engine: Arc<MockEngine>, metadata: MetadataStore) -> Self {
		Self { engine, metadata }
	}
}

#[async_trait]
impl Descriptor for ArpDescriptor {
	fn name(&self) -> &str {
		ARP
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(ARP_PREFIX)
	}

	fn validate(&self, key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let arp = typed::<ArpEntry>(value).map_err(|e| ValidationError::new(e.0))?;

		if arp.ip.parse::<IpAddr>().is_err() {
			return Err(ValidationError::new(format!("invalid ip <ip='{}'>", arp.ip)).with_field("ip"));
		}
		if !is_valid_mac(&arp.mac) {
			return Err(
				ValidationError::new(format!("invalid mac <mac='{}'>", arp.mac)).with_field("mac"),
			);
		}
		if key != arp_key(&arp.interface, &arp.ip) {
			return Err(ValidationError::new(format!(
				"entry doesn't belong under <key='{key}'>"
			))
			.with_field("interface")
			.with_field("ip"));
		}

		Ok(())
	}

	async fn create(
		&self,
		_key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let arp = typed::<ArpEntry>(value)?.clone();

		self.engine
			.add_arp(EngineArp {
				sw_if_index: sw_if_index(&self.metadata, &arp.interface)?,
				ip: arp.ip,
				mac: arp.mac,
				is_static: arp.is_static,
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
		let arp = typed::<ArpEntry>(value)?.clone();

		self.engine
			.delete_arp(sw_if_index(&self.metadata, &arp.interface)?, &arp.ip)
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
		Ok(self
			.engine
			.dump_arps()
			.await?
			.into_iter()
			.filter_map(|arp| {
				let Some(interface) = interface_name(&self.metadata, arp.sw_if_index) else {
					warn!(sw_if_index = arp.sw_if_index, ip = %arp.ip, "ARP entry on unknown interface, ignoring");
					return None;
				};

				Some(KvWithMetadata {
					key: arp_key(&interface, &arp.ip),
					value: Arc::new(ArpEntry {
						interface,
						ip: arp.ip,
						mac: arp.mac,
						is_static: arp.is_static,
					}),
					metadata: None,
					origin: Origin::Unknown,
				})
			})
			.collect())
	}

	fn retrieve_dependencies(&self) -> Vec<String> {
		vec![INTERFACE.to_string()]
	}

	fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
		typed::<ArpEntry>(value)
			.map(|arp| vec![Dependency::on("interface-exists", interface_key(&arp.interface))])
			.unwrap_or_default()
	}

	fn equivalent_values(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
		match (typed::<ArpEntry>(old), typed::<ArpEntry>(new)) {
			(Ok(old), Ok(new)) => {
				old.interface == new.interface
					&& same_ip(&old.ip, &new.ip)
					&& same_mac(&old.mac, &new.mac)
					&& old.is_static == new.is_static
			}
			_ => false,
		}
	}
}
