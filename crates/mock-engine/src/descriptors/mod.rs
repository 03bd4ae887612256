use nca_scheduler::{cast, MetadataStore, OperationError, Value};

use super::{
	engine::EngineError,
	model::{
		bridge_domain_key, interface_key, parse_bridge_domain_key, parse_interface_key,
	},
};

mod arp;
mod bd_interface;
mod bridge_domain;
mod fib;
mod interface;
mod route;
mod xconnect;

pub use arp::ArpDescriptor;
pub use bd_interface::BdInterfaceDescriptor;
pub use bridge_domain::{BdMeta, BridgeDomainDescriptor};
pub use fib::FibDescriptor;
pub use interface::{InterfaceDescriptor, InterfaceMeta};
pub use route::RouteDescriptor;
pub use xconnect::XConnectDescriptor;

pub const INTERFACE: &str = "interface";
pub const BRIDGE_DOMAIN: &str = "bridge-domain";
pub const BD_INTERFACE: &str = "bd-interface";
pub const ARP: &str = "arp";
pub const FIB: &str = "fib";
pub const ROUTE: &str = "route";
pub const XCONNECT: &str = "xconnect";

impl From<EngineError> for OperationError {
	fn from(e: EngineError) -> Self {
		Self::new(e.to_string())
	}
}

fn typed<T: Value>(value: &dyn Value) -> Result<&T, OperationError> {
	cast::<T>(value).ok_or_else(|| {
		OperationError::new(format!(
			"unexpected value type <expected='{}'>",
			std::any::type_name::<T>()
		))
	})
}

/// `sw_if_index` of a configured interface.
fn sw_if_index(metadata: &MetadataStore, interface: &str) -> Result<u32, OperationError> {
	metadata
		.lookup_by_key(INTERFACE, &interface_key(interface))
		.and_then(|meta| meta.handle())
		.ok_or_else(|| OperationError::new(format!("unknown interface <name='{interface}'>")))
}

fn interface_name(metadata: &MetadataStore, sw_if_index: u32) -> Option<String> {
	metadata
		.lookup_by_handle(INTERFACE, sw_if_index)
		.and_then(|(key, _)| parse_interface_key(&key).map(ToString::to_string))
}

/// `bd_id` of a configured bridge domain.
fn bd_id(metadata: &MetadataStore, bridge_domain: &str) -> Result<u32, OperationError> {
	metadata
		.lookup_by_key(BRIDGE_DOMAIN, &bridge_domain_key(bridge_domain))
		.and_then(|meta| meta.handle())
		.ok_or_else(|| {
			OperationError::new(format!("unknown bridge domain <name='{bridge_domain}'>"))
		})
}

fn bridge_domain_name(metadata: &MetadataStore, bd_id: u32) -> Option<String> {
	metadata
		.lookup_by_handle(BRIDGE_DOMAIN, bd_id)
		.and_then(|(key, _)| parse_bridge_domain_key(&key).map(ToString::to_string))
}
