//!
//! # Mock engine
//!
//! An in-memory packet forwarding engine plus one [`Descriptor`](nca_scheduler::Descriptor) per
//! configuration object it understands: interfaces, bridge domains and their member bindings,
//! ARP entries, L2 FIB entries, routes and cross-connects.
//!
//! It stands in for a real dataplane: objects reference each other by engine-allocated handles,
//! refuse to be deleted while still in use, and every call can be delayed or made to fail. This
//! is what the agent drives when no real forwarding engine is configured, and what the scenario
//! tests run the scheduler against.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::sync::Arc;

use nca_scheduler::{MetadataStore, RegistryBuilder, SharedValue};
use serde::de::DeserializeOwned;

pub mod descriptors;
pub mod engine;
pub mod model;

pub use engine::{EngineError, MockEngine};

use descriptors::{
	ArpDescriptor, BdInterfaceDescriptor, BridgeDomainDescriptor, FibDescriptor,
	InterfaceDescriptor, RouteDescriptor, XConnectDescriptor,
};
use model::{
	parse_bd_interface_key, parse_bridge_domain_key, parse_interface_address_key,
	parse_interface_key, ArpEntry, BridgeDomain, FibEntry, Interface, Route, XConnect,
	ARP_PREFIX, FIB_PREFIX, ROUTE_PREFIX, XCONNECT_PREFIX,
};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("no configuration object lives under <key='{0}'>")]
	UnknownKey(String),
	#[error("<key='{0}'> is derived from its parent and can't be configured directly")]
	DerivedKey(String),
	#[error("malformed value for <key='{key}'>: {source}")]
	Malformed {
		key: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Registers every descriptor of the engine, sharing `metadata` with the scheduler so that
/// descriptors can resolve each other's handles.
pub fn register_all(
	builder: &mut RegistryBuilder,
	engine: &Arc<MockEngine>,
	metadata: &MetadataStore,
) -> Result<(), nca_scheduler::Error> {
	builder
		.register(InterfaceDescriptor::new(Arc::clone(engine)))?
		.register(BridgeDomainDescriptor::new(
			Arc::clone(engine),
			metadata.clone(),
		))?
		.register(BdInterfaceDescriptor::new(
			Arc::clone(engine),
			metadata.clone(),
		))?
		.register(ArpDescriptor::new(Arc::clone(engine), metadata.clone()))?
		.register(FibDescriptor::new(Arc::clone(engine), metadata.clone()))?
		.register(RouteDescriptor::new(Arc::clone(engine), metadata.clone()))?
		.register(XConnectDescriptor::new(
			Arc::clone(engine),
			metadata.clone(),
		))?;

	Ok(())
}

fn decode<T: DeserializeOwned + nca_scheduler::Value>(
	key: &str,
	value: serde_json::Value,
) -> Result<SharedValue, DecodeError> {
	serde_json::from_value::<T>(value)
		.map(|value| -> SharedValue { Arc::new(value) })
		.map_err(|source| DecodeError::Malformed {
			key: key.to_string(),
			source,
		})
}

/// Turns the JSON representation of a configuration object into the typed value its descriptor
/// expects, picked by key.
pub fn decode_value(key: &str, value: serde_json::Value) -> Result<SharedValue, DecodeError> {
	if parse_interface_key(key).is_some() {
		decode::<Interface>(key, value)
	} else if parse_bridge_domain_key(key).is_some() {
		decode::<BridgeDomain>(key, value)
	} else if parse_interface_address_key(key).is_some() || parse_bd_interface_key(key).is_some()
	{
		Err(DecodeError::DerivedKey(key.to_string()))
	} else if key.starts_with(ARP_PREFIX) {
		decode::<ArpEntry>(key, value)
	} else if key.starts_with(FIB_PREFIX) {
		decode::<FibEntry>(key, value)
	} else if key.starts_with(ROUTE_PREFIX) {
		decode::<Route>(key, value)
	} else if key.starts_with(XCONNECT_PREFIX) {
		decode::<XConnect>(key, value)
	} else {
		Err(DecodeError::UnknownKey(key.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nca_scheduler::cast;
	use serde_json::json;

	#[test]
	fn test_decode_value() {
		let value = decode_value(
			"if/tap0",
			json!({"kind": "tap", "enabled": true, "ip_addresses": ["10.0.0.1/24"]}),
		)
		.unwrap();
		let interface = cast::<Interface>(value.as_ref()).unwrap();
		assert_eq!(interface.mtu, None);
		assert_eq!(interface.ip_addresses, vec!["10.0.0.1/24"]);

		assert!(matches!(
			decode_value("bd/b1/interface/tap0", json!({})),
			Err(DecodeError::DerivedKey(_))
		));
		assert!(matches!(
			decode_value("acl/a1", json!({})),
			Err(DecodeError::UnknownKey(_))
		));
		assert!(matches!(
			decode_value("if/tap0", json!({"kind": "warp"})),
			Err(DecodeError::Malformed { .. })
		));
	}
}
