use std::{collections::HashSet, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use nca_scheduler::{
	Dependency, Descriptor, KeyValuePair, KvWithMetadata, Metadata, MetadataStore,
	OperationError, Origin, SharedMetadata, ValidationError, Value,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
	engine::{EngineError, MockEngine},
	model::{
		bd_interface_key, bridge_domain_key, interface_key, is_valid_mac, parse_bridge_domain_key,
		same_ip, same_mac, ArpTermination, BdInterface, BdMember, BridgeDomain,
		BRIDGE_DOMAIN_PREFIX,
	},
};

use super::{interface_name, typed, BRIDGE_DOMAIN, INTERFACE};

/// Identifier of the bridge domain in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdMeta {
	pub bd_id: u32,
}

impl Metadata for BdMeta {
	fn handle(&self) -> Option<u32> {
		Some(self.bd_id)
	}
}

/// `bd/<name>`.
///
/// Member interfaces are split into `bd/<name>/interface/<interface>` derived values, the
/// bridge domain itself waits for all of them to exist. Bridge domain IDs are allocated here,
/// the engine only stores them.
pub struct BridgeDomainDescriptor {
	engine: Arc<MockEngine>,
	metadata: MetadataStore,
	next_bd_id: Mutex<u32>,
}

impl BridgeDomainDescriptor {
	#[must_use]
	pub fn new(engine: Arc<MockEngine>, metadata: MetadataStore) -> Self {
		Self {
			engine,
			metadata,
			next_bd_id: Mutex::new(1),
		}
	}

	fn allocate_bd_id(&self) -> u32 {
		let mut next = self.next_bd_id.lock();
		let bd_id = *next;
		*next += 1;
		bd_id
	}
}

fn same_termination(a: &ArpTermination, b: &ArpTermination) -> bool {
	same_ip(&a.ip, &b.ip) && same_mac(&a.mac, &b.mac)
}

/// Entries of `from` missing in `other`.
fn missing_terminations<'a>(
	from: &'a [ArpTermination],
	other: &'a [ArpTermination],
) -> impl Iterator<Item = &'a ArpTermination> {
	from.iter()
		.filter(move |entry| !other.iter().any(|o| same_termination(entry, o)))
}

fn name_of(key: &str) -> Result<&str, OperationError> {
	parse_bridge_domain_key(key)
		.ok_or_else(|| OperationError::new(format!("not a bridge domain key <key='{key}'>")))
}

#[async_trait]
impl Descriptor for BridgeDomainDescriptor {
	fn name(&self) -> &str {
		BRIDGE_DOMAIN
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(BRIDGE_DOMAIN_PREFIX)
	}

	fn key_selector(&self, key: &str) -> bool {
		parse_bridge_domain_key(key).is_some()
	}

	fn with_metadata(&self) -> bool {
		true
	}

	fn validate(&self, _key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let bd = typed::<BridgeDomain>(value).map_err(|e| ValidationError::new(e.0))?;

		if bd.interfaces.iter().filter(|member| member.bvi).count() > 1 {
			return Err(ValidationError::new("bridge domain defined with multiple BVIs")
				.with_field("interfaces.bvi"));
		}

		let mut names = HashSet::new();
		if let Some(member) = bd
			.interfaces
			.iter()
			.find(|member| !names.insert(member.name.as_str()))
		{
			return Err(ValidationError::new(format!(
				"interface listed twice <name='{}'>",
				member.name
			))
			.with_field("interfaces.name"));
		}

		for entry in &bd.arp_termination {
			if entry.ip.parse::<IpAddr>().is_err() {
				return Err(ValidationError::new(format!("invalid ip <ip='{}'>", entry.ip))
					.with_field("arp_termination.ip"));
			}
			if !is_valid_mac(&entry.mac) {
				return Err(ValidationError::new(format!("invalid mac <mac='{}'>", entry.mac))
					.with_field("arp_termination.mac"));
			}
		}

		Ok(())
	}

	async fn create(
		&self,
		key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let bd = typed::<BridgeDomain>(value)?.clone();
		let name = name_of(key)?;
		let bd_id = self.allocate_bd_id();

		self.engine
			.add_bridge_domain(bd_id, name, bd.flood, bd.learn, bd.forward)
			.await?;

		let terminated = async {
			for entry in &bd.arp_termination {
				self.engine
					.add_arp_termination(bd_id, &entry.ip, &entry.mac)
					.await?;
			}
			Ok::<_, EngineError>(())
		}
		.await;

		if let Err(e) = terminated {
			if let Err(undo) = self.engine.delete_bridge_domain(bd_id).await {
				warn!(%name, bd_id, %undo, "Failed to remove half-created bridge domain");
			}
			return Err(e.into());
		}

		debug!(%name, bd_id, "Bridge domain created");

		Ok(Some(Arc::new(BdMeta { bd_id })))
	}

	fn supports_update(&self) -> bool {
		true
	}

	/// Only the ARP termination table is updated in place.
	async fn update(
		&self,
		_key: &str,
		old: &dyn Value,
		new: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let old = typed::<BridgeDomain>(old)?.clone();
		let new = typed::<BridgeDomain>(new)?.clone();
		let bd_id = metadata
			.as_ref()
			.and_then(|meta| meta.handle())
			.ok_or_else(|| OperationError::new("missing bd_id"))?;

		// Obsolete entries go first, a new entry may reuse their IP.
		for entry in missing_terminations(&old.arp_termination, &new.arp_termination) {
			self.engine
				.remove_arp_termination(bd_id, &entry.ip)
				.await?;
		}
		for entry in missing_terminations(&new.arp_termination, &old.arp_termination) {
			self.engine
				.add_arp_termination(bd_id, &entry.ip, &entry.mac)
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
		match (typed::<BridgeDomain>(old), typed::<BridgeDomain>(new)) {
			(Ok(old), Ok(new)) => !old.same_parameters(new),
			_ => true,
		}
	}

	async fn delete(
		&self,
		_key: &str,
		_value: &dyn Value,
		metadata: Option<SharedMetadata>,
	) -> Result<(), OperationError> {
		let bd_id = metadata
			.and_then(|meta| meta.handle())
			.ok_or_else(|| OperationError::new("missing bd_id"))?;

		self.engine.delete_bridge_domain(bd_id).await?;

		Ok(())
	}

	fn supports_retrieve(&self) -> bool {
		true
	}

	async fn retrieve(
		&self,
		correlate: &[KvWithMetadata],
	) -> Result<Vec<KvWithMetadata>, OperationError> {
		let dumped = self.engine.dump_bridge_domains().await?;

		// Keep allocating after whatever the engine already holds.
		if let Some(max) = dumped.iter().map(|(bd_id, _)| *bd_id).max() {
			let mut next = self.next_bd_id.lock();
			*next = (*next).max(max + 1);
		}

		let mut retrieved = Vec::with_capacity(dumped.len());

		for (bd_id, bd) in dumped {
			let key = bridge_domain_key(&bd.tag);

			let mut interfaces = Vec::with_capacity(bd.members.len());
			for (sw_if_index, bvi) in bd.members {
				match interface_name(&self.metadata, sw_if_index) {
					Some(name) => interfaces.push(BdMember { name, bvi }),
					None => warn!(bd = %bd.tag, sw_if_index, "Unknown bridge domain member, ignoring"),
				}
			}

			let mut arp_termination = bd
				.arp_termination
				.into_iter()
				.map(|(ip, mac)| ArpTermination { ip, mac })
				.collect::<Vec<_>>();

			// Present members and ARP entries in the order they were configured.
			if let Some(expected) = correlate
				.iter()
				.find(|kv| kv.key == key)
				.and_then(|kv| typed::<BridgeDomain>(kv.value.as_ref()).ok())
			{
				interfaces.sort_by_key(|member| {
					expected
						.interfaces
						.iter()
						.position(|e| e.name == member.name)
						.unwrap_or(usize::MAX)
				});
				arp_termination.sort_by_key(|entry| {
					expected
						.arp_termination
						.iter()
						.position(|e| same_termination(e, entry))
						.unwrap_or(usize::MAX)
				});
			}

			retrieved.push(KvWithMetadata {
				key,
				value: Arc::new(BridgeDomain {
					flood: bd.flood,
					learn: bd.learn,
					forward: bd.forward,
					interfaces,
					arp_termination,
				}),
				metadata: Some(Arc::new(BdMeta { bd_id })),
				origin: Origin::Unknown,
			});
		}

		Ok(retrieved)
	}

	fn retrieve_dependencies(&self) -> Vec<String> {
		vec![INTERFACE.to_string()]
	}

	fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
		typed::<BridgeDomain>(value)
			.map(|bd| {
				bd.interfaces
					.iter()
					.map(|member| Dependency::on("interface-exists", interface_key(&member.name)))
					.collect()
			})
			.unwrap_or_default()
	}

	fn derived_values(&self, key: &str, value: &dyn Value) -> Vec<KeyValuePair> {
		let (Some(name), Ok(bd)) = (parse_bridge_domain_key(key), typed::<BridgeDomain>(value))
		else {
			return Vec::new();
		};

		bd.interfaces
			.iter()
			.map(|member| {
				KeyValuePair::new(
					bd_interface_key(name, &member.name),
					BdInterface {
						bridge_domain: name.to_string(),
						name: member.name.clone(),
						bvi: member.bvi,
					},
				)
			})
			.collect()
	}

	/// Members are compared through their derived bindings. The ARP termination table is
	/// compared as a set, case-insensitively.
	fn equivalent_values(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
		let (Ok(old), Ok(new)) = (typed::<BridgeDomain>(old), typed::<BridgeDomain>(new)) else {
			return false;
		};

		old.same_parameters(new)
			&& missing_terminations(&old.arp_termination, &new.arp_termination)
				.next()
				.is_none()
			&& missing_terminations(&new.arp_termination, &old.arp_termination)
				.next()
				.is_none()
	}
}
