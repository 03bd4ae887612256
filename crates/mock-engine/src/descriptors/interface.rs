use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use nca_scheduler::{
	Descriptor, KeyValuePair, KvWithMetadata, Metadata, OperationError, Origin, SharedMetadata,
	ValidationError, Value,
};
use tracing::{debug, warn};

use crate::{
	engine::{EngineError, MockEngine},
	model::{
		interface_address_key, interface_key, is_valid_mac, parse_cidr, parse_interface_key,
		same_mac, Interface, InterfaceAddress, InterfaceKind, DEFAULT_MTU, INTERFACE_PREFIX,
	},
};

use super::{typed, INTERFACE};

const MIN_MTU: u32 = 64;
const MAX_MTU: u32 = 9216;

/// Index of the interface in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceMeta {
	pub sw_if_index: u32,
}

impl Metadata for InterfaceMeta {
	fn handle(&self) -> Option<u32> {
		Some(self.sw_if_index)
	}
}

/// `if/<name>`.
///
/// Every configured address is also exposed as an `if/<name>/addr/<cidr>` property, so that
/// routes can wait for a usable address. Changing the kind recreates the interface, everything
/// else is updated in place.
pub struct InterfaceDescriptor {
	engine: Arc<MockEngine>,
}

impl InterfaceDescriptor {
	#[must_use]
	pub const fn new(engine: Arc<MockEngine>) -> Self {
		Self { engine }
	}
}

/// Addresses in canonical form, order-insensitive.
fn address_set(addresses: &[String]) -> BTreeSet<String> {
	addresses
		.iter()
		.map(|address| {
			parse_cidr(address).map_or_else(|| address.clone(), |(ip, len)| format!("{ip}/{len}"))
		})
		.collect()
}

fn name_of(key: &str) -> Result<&str, OperationError> {
	parse_interface_key(key)
		.ok_or_else(|| OperationError::new(format!("not an interface key <key='{key}'>")))
}

fn meta_of(metadata: Option<&SharedMetadata>) -> Result<u32, OperationError> {
	metadata
		.and_then(|meta| meta.handle())
		.ok_or_else(|| OperationError::new("missing sw_if_index"))
}

#[async_trait]
impl Descriptor for InterfaceDescriptor {
	fn name(&self) -> &str {
		INTERFACE
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(INTERFACE_PREFIX)
	}

	fn key_selector(&self, key: &str) -> bool {
		parse_interface_key(key).is_some()
	}

	fn with_metadata(&self) -> bool {
		true
	}

	fn validate(&self, _key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let interface = typed::<Interface>(value).map_err(|e| ValidationError::new(e.0))?;

		if interface.kind == InterfaceKind::Local {
			return Err(ValidationError::new("local interfaces can't be configured").with_field("kind"));
		}

		if let Some(mtu) = interface.mtu {
			if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
				return Err(ValidationError::new(format!(
					"mtu out of range <mtu='{mtu}'>"
				))
				.with_field("mtu"));
			}
		}

		if let Some(mac) = &interface.mac {
			if !is_valid_mac(mac) {
				return Err(ValidationError::new(format!("invalid mac <mac='{mac}'>")).with_field("mac"));
			}
		}

		if let Some(address) = interface
			.ip_addresses
			.iter()
			.find(|address| parse_cidr(address).is_none())
		{
			return Err(
				ValidationError::new(format!("invalid address <address='{address}'>"))
					.with_field("ip_addresses"),
			);
		}

		Ok(())
	}

	async fn create(
		&self,
		key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let interface = typed::<Interface>(value)?.clone();
		let name = name_of(key)?;

		let sw_if_index = self
			.engine
			.add_interface(name, interface.kind, interface.mac.as_deref())
			.await?;

		let configured = async {
			if let Some(mtu) = interface.mtu {
				self.engine.set_interface_mtu(sw_if_index, mtu).await?;
			}
			for address in &interface.ip_addresses {
				self.engine
					.add_interface_address(sw_if_index, address)
					.await?;
			}
			if interface.enabled {
				self.engine
					.set_interface_enabled(sw_if_index, true)
					.await?;
			}
			Ok::<_, EngineError>(())
		}
		.await;

		if let Err(e) = configured {
			if let Err(undo) = self.engine.delete_interface(sw_if_index).await {
				warn!(%name, sw_if_index, %undo, "Failed to remove half-created interface");
			}
			return Err(e.into());
		}

		debug!(%name, sw_if_index, "Interface created");

		Ok(Some(Arc::new(InterfaceMeta { sw_if_index })))
	}

	fn supports_update(&self) -> bool {
		true
	}

	async fn update(
		&self,
		_key: &str,
		old: &dyn Value,
		new: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let old = typed::<Interface>(old)?.clone();
		let new = typed::<Interface>(new)?.clone();
		let sw_if_index = meta_of(metadata.as_ref())?;

		if old.enabled && !new.enabled {
			self.engine
				.set_interface_enabled(sw_if_index, false)
				.await?;
		}

		let mtu = new.mtu.unwrap_or(DEFAULT_MTU);
		if old.mtu.unwrap_or(DEFAULT_MTU) != mtu {
			self.engine.set_interface_mtu(sw_if_index, mtu).await?;
		}

		if let Some(mac) = &new.mac {
			if !old.mac.as_ref().is_some_and(|old| same_mac(old, mac)) {
				self.engine.set_interface_mac(sw_if_index, mac).await?;
			}
		}

		let (old_addresses, new_addresses) =
			(address_set(&old.ip_addresses), address_set(&new.ip_addresses));
		for address in old_addresses.difference(&new_addresses) {
			self.engine
				.del_interface_address(sw_if_index, address)
				.await?;
		}
		for address in new_addresses.difference(&old_addresses) {
			self.engine
				.add_interface_address(sw_if_index, address)
				.await?;
		}

		if !old.enabled && new.enabled {
			self.engine
				.set_interface_enabled(sw_if_index, true)
				.await?;
		}

		Ok(metadata)
	}

	fn update_with_recreate(
		&self,
		_key: &str,
		old: &dyn Value,
		new: &dyn Value,
		_metadata: Option<&SharedMetadata>,
	) -> bool {
		match (typed::<Interface>(old), typed::<Interface>(new)) {
			(Ok(old), Ok(new)) => old.kind != new.kind,
			_ => true,
		}
	}

	async fn delete(
		&self,
		_key: &str,
		_value: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError> {
		let sw_if_index = meta_of(metadata.as_ref())?;
		self.engine.delete_interface(sw_if_index).await?;

		Ok(())
	}

	fn supports_retrieve(&self) -> bool {
		true
	}

	async fn retrieve(
		&self,
		correlate: &[KvWithMetadata],
	) -> Result<Vec<KvWithMetadata>, OperationError> {
		let mut retrieved = Vec::new();

		for (sw_if_index, dumped) in self.engine.dump_interfaces().await? {
			let (name, origin) = match (&dumped.tag, dumped.kind) {
				(Some(tag), _) => (tag.clone(), Origin::Unknown),
				(None, InterfaceKind::Local) => ("local0".to_string(), Origin::Southbound),
				(None, _) => {
					warn!(sw_if_index, "Skipping interface without a name");
					continue;
				}
			};
			let key = interface_key(&name);

			let expected = correlate
				.iter()
				.find(|kv| kv.key == key)
				.and_then(|kv| typed::<Interface>(kv.value.as_ref()).ok());

			let mut interface = Interface {
				kind: dumped.kind,
				enabled: dumped.enabled,
				mtu: Some(dumped.mtu),
				mac: Some(dumped.mac),
				ip_addresses: dumped.addresses,
			};

			if dumped.kind == InterfaceKind::Local {
				interface.mtu = None;
				interface.mac = None;
			}

			// Fields the engine fills in when left unset.
			if let Some(expected) = expected {
				if expected.mtu.is_none() && interface.mtu == Some(DEFAULT_MTU) {
					interface.mtu = None;
				}
				if expected.mac.is_none() {
					interface.mac = None;
				}
				if address_set(&expected.ip_addresses) == address_set(&interface.ip_addresses) {
					interface.ip_addresses.clone_from(&expected.ip_addresses);
				}
			}

			retrieved.push(KvWithMetadata {
				key,
				value: Arc::new(interface),
				metadata: Some(Arc::new(InterfaceMeta { sw_if_index })),
				origin,
			});
		}

		Ok(retrieved)
	}

	fn derived_values(&self, key: &str, value: &dyn Value) -> Vec<KeyValuePair> {
		let (Some(name), Ok(interface)) = (parse_interface_key(key), typed::<Interface>(value))
		else {
			return Vec::new();
		};

		interface
			.ip_addresses
			.iter()
			.map(|address| {
				KeyValuePair::new(
					interface_address_key(name, address),
					InterfaceAddress {
						interface: name.to_string(),
						address: address.clone(),
					},
				)
			})
			.collect()
	}

	/// Address order and MAC case don't matter, nor does a MAC left to the engine.
	fn equivalent_values(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
		let (Ok(old), Ok(new)) = (typed::<Interface>(old), typed::<Interface>(new)) else {
			return false;
		};

		old.kind == new.kind
			&& old.enabled == new.enabled
			&& old.mtu.unwrap_or(DEFAULT_MTU) == new.mtu.unwrap_or(DEFAULT_MTU)
			&& new.mac.as_ref().map_or(true, |mac| {
				old.mac.as_ref().is_some_and(|old| same_mac(old, mac))
			})
			&& address_set(&old.ip_addresses) == address_set(&new.ip_addresses)
	}
}
