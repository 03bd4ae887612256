use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use nca_scheduler::{
	AnyOf, Dependency, Descriptor, KvWithMetadata, MetadataStore, OperationError, Origin,
	SharedMetadata, ValidationError, Value,
};
use tracing::warn;

use crate::{
	engine::{EngineRoute, MockEngine},
	model::{
		interface_key, network_contains, parse_cidr, parse_interface_address_key, route_key,
		Route, INTERFACE_PREFIX, ROUTE_PREFIX,
	},
};

use super::{interface_name, sw_if_index, typed, INTERFACE, ROUTE};

/// `route/<vrf>/<dst>/<gw>`.
///
/// A route without an outgoing interface waits until some interface has an address on the
/// gateway's network.
pub struct RouteDescriptor {
	engine: Arc<MockEngine>,
	metadata: MetadataStore,
}

impl RouteDescriptor {
	#[must_use]
	pub const fn new(engine: Arc<MockEngine>, metadata: MetadataStore) -> Self {
		Self { engine, metadata }
	}
}

/// Any interface address whose network contains `gw`.
fn gateway_reachable(gw: IpAddr) -> AnyOf {
	AnyOf {
		key_prefixes: vec![INTERFACE_PREFIX.to_string()],
		selector: Some(Arc::new(move |key: &str| {
			parse_interface_address_key(key)
				.is_some_and(|(_, address)| network_contains(address, gw))
		})),
	}
}

#[async_trait]
impl Descriptor for RouteDescriptor {
	fn name(&self) -> &str {
		ROUTE
	}

	fn key_prefix(&self) -> Option<&str> {
		Some(ROUTE_PREFIX)
	}

	fn validate(&self, key: &str, value: &dyn Value) -> Result<(), ValidationError> {
		let route = typed::<Route>(value).map_err(|e| ValidationError::new(e.0))?;

		if parse_cidr(&route.dst).is_none() {
			return Err(ValidationError::new(format!("invalid destination <dst='{}'>", route.dst))
				.with_field("dst"));
		}
		if let Some(gw) = &route.gw {
			if gw.parse::<IpAddr>().is_err() {
				return Err(ValidationError::new(format!("invalid gateway <gw='{gw}'>")).with_field("gw"));
			}
		}
		if route.gw.is_none() && route.outgoing_interface.is_none() {
			return Err(ValidationError::new("route needs a gateway or an outgoing interface")
				.with_field("gw")
				.with_field("outgoing_interface"));
		}
		if key != route_key(route) {
			return Err(ValidationError::new(format!(
				"route doesn't belong under <key='{key}'>"
			))
			.with_field("vrf")
			.with_field("dst"));
		}

		Ok(())
	}

	async fn create(
		&self,
		_key: &str,
		value: &dyn Value,
	) -> Result<Option<SharedMetadata>, OperationError> {
		let route = typed::<Route>(value)?.clone();

		let sw_if_index = match &route.outgoing_interface {
			Some(interface) => Some(sw_if_index(&self.metadata, interface)?),
			None => None,
		};

		self.engine
			.add_route(EngineRoute {
				vrf: route.vrf,
				dst: route.dst,
				gw: route.gw,
				sw_if_index,
				weight: route.weight,
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
		let route = typed::<Route>(value)?.clone();

		self.engine
			.delete_route(route.vrf, &route.dst, route.gw.as_deref())
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

		for route in self.engine.dump_routes().await? {
			let outgoing_interface = match route.sw_if_index {
				Some(sw_if_index) => match interface_name(&self.metadata, sw_if_index) {
					Some(name) => Some(name),
					None => {
						warn!(sw_if_index, dst = %route.dst, "Route via unknown interface, ignoring");
						continue;
					}
				},
				None => None,
			};

			let route = Route {
				vrf: route.vrf,
				dst: route.dst,
				gw: route.gw,
				outgoing_interface,
				weight: route.weight,
			};

			retrieved.push(KvWithMetadata {
				key: route_key(&route),
				value: Arc::new(route),
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
		let Ok(route) = typed::<Route>(value) else {
			return Vec::new();
		};

		match (&route.outgoing_interface, &route.gw) {
			(Some(interface), _) => vec![Dependency::on("interface-exists", interface_key(interface))],
			(None, Some(gw)) => gw
				.parse::<IpAddr>()
				.map(|gw| vec![Dependency::any_of("any-address", gateway_reachable(gw))])
				.unwrap_or_default(),
			(None, None) => Vec::new(),
		}
	}
}
