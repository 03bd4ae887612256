//! Configuration objects of the forwarding engine and the keys they live under.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub const INTERFACE_PREFIX: &str = "if/";
pub const BRIDGE_DOMAIN_PREFIX: &str = "bd/";
pub const ARP_PREFIX: &str = "arp/";
pub const FIB_PREFIX: &str = "fib/";
pub const ROUTE_PREFIX: &str = "route/";
pub const XCONNECT_PREFIX: &str = "xconnect/";

const ADDRESS_INFIX: &str = "/addr/";
const BD_INTERFACE_INFIX: &str = "/interface/";

/// MTU the engine gives interfaces configured without one.
pub const DEFAULT_MTU: u32 = 1500;

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterfaceKind {
	/// The engine's own placeholder interface, never configured from the northbound plane.
	Local,
	Loopback,
	Ethernet,
	Tap,
	Memif,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
	pub kind: InterfaceKind,
	#[serde(default)]
	pub enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mtu: Option<u32>,
	/// Left to the engine when not set.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mac: Option<String>,
	/// CIDR notation.
	#[serde(default)]
	pub ip_addresses: Vec<String>,
}

/// Derived from an [`Interface`] for each of its addresses, so that other values can depend on
/// an address being configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
	pub interface: String,
	pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdMember {
	pub name: String,
	#[serde(default)]
	pub bvi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpTermination {
	pub ip: String,
	pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDomain {
	#[serde(default)]
	pub flood: bool,
	#[serde(default)]
	pub learn: bool,
	#[serde(default)]
	pub forward: bool,
	#[serde(default)]
	pub interfaces: Vec<BdMember>,
	#[serde(default)]
	pub arp_termination: Vec<ArpTermination>,
}

impl BridgeDomain {
	/// Whether both have the same parameters, which can only be changed by recreating the bridge
	/// domain.
	#[must_use]
	pub const fn same_parameters(&self, other: &Self) -> bool {
		self.flood == other.flood && self.learn == other.learn && self.forward == other.forward
	}
}

/// Binding of an interface into a bridge domain, derived from a [`BridgeDomain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdInterface {
	pub bridge_domain: String,
	pub name: String,
	pub bvi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
	pub interface: String,
	pub ip: String,
	pub mac: String,
	#[serde(default, rename = "static")]
	pub is_static: bool,
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FibAction {
	Forward,
	Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibEntry {
	pub bridge_domain: String,
	pub mac: String,
	pub action: FibAction,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub outgoing_interface: Option<String>,
	#[serde(default)]
	pub bvi: bool,
	#[serde(default, rename = "static")]
	pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
	#[serde(default)]
	pub vrf: u32,
	/// Destination network, CIDR notation.
	pub dst: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gw: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub outgoing_interface: Option<String>,
	#[serde(default)]
	pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XConnect {
	pub rx: String,
	pub tx: String,
}

#[must_use]
pub fn interface_key(name: &str) -> String {
	format!("{INTERFACE_PREFIX}{name}")
}

#[must_use]
pub fn interface_address_key(interface: &str, address: &str) -> String {
	format!("{INTERFACE_PREFIX}{interface}{ADDRESS_INFIX}{address}")
}

#[must_use]
pub fn bridge_domain_key(name: &str) -> String {
	format!("{BRIDGE_DOMAIN_PREFIX}{name}")
}

#[must_use]
pub fn bd_interface_key(bridge_domain: &str, interface: &str) -> String {
	format!("{BRIDGE_DOMAIN_PREFIX}{bridge_domain}{BD_INTERFACE_INFIX}{interface}")
}

#[must_use]
pub fn arp_key(interface: &str, ip: &str) -> String {
	format!("{ARP_PREFIX}{interface}/{ip}")
}

#[must_use]
pub fn fib_key(bridge_domain: &str, mac: &str) -> String {
	format!("{FIB_PREFIX}{bridge_domain}/{}", mac.to_lowercase())
}

#[must_use]
pub fn route_key(route: &Route) -> String {
	format!(
		"{ROUTE_PREFIX}{}/{}/{}",
		route.vrf,
		route.dst,
		route.gw.as_deref().unwrap_or("-")
	)
}

#[must_use]
pub fn xconnect_key(rx: &str) -> String {
	format!("{XCONNECT_PREFIX}{rx}")
}

/// Name of the interface behind `if/<name>`, `None` for any other key.
#[must_use]
pub fn parse_interface_key(key: &str) -> Option<&str> {
	key.strip_prefix(INTERFACE_PREFIX)
		.filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Interface and address behind `if/<name>/addr/<address>`.
#[must_use]
pub fn parse_interface_address_key(key: &str) -> Option<(&str, &str)> {
	key.strip_prefix(INTERFACE_PREFIX)?
		.split_once(ADDRESS_INFIX)
		.filter(|(interface, address)| !interface.is_empty() && !address.is_empty())
}

/// Name of the bridge domain behind `bd/<name>`.
#[must_use]
pub fn parse_bridge_domain_key(key: &str) -> Option<&str> {
	key.strip_prefix(BRIDGE_DOMAIN_PREFIX)
		.filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Bridge domain and interface behind `bd/<name>/interface/<interface>`.
#[must_use]
pub fn parse_bd_interface_key(key: &str) -> Option<(&str, &str)> {
	key.strip_prefix(BRIDGE_DOMAIN_PREFIX)?
		.split_once(BD_INTERFACE_INFIX)
		.filter(|(bd, interface)| {
			!bd.is_empty() && !interface.is_empty() && !interface.contains('/')
		})
}

/// Address and prefix length of a CIDR.
#[must_use]
pub fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
	let (ip, len) = cidr.split_once('/')?;
	let ip = ip.parse::<IpAddr>().ok()?;
	let len = len.parse::<u8>().ok()?;

	let max = if ip.is_ipv4() { 32 } else { 128 };
	(len <= max).then_some((ip, len))
}

/// Whether the network of `cidr` contains `ip`.
#[must_use]
pub fn network_contains(cidr: &str, ip: IpAddr) -> bool {
	let Some((network, len)) = parse_cidr(cidr) else {
		return false;
	};

	match (network, ip) {
		(IpAddr::V4(network), IpAddr::V4(ip)) => {
			let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
			u32::from(network) & mask == u32::from(ip) & mask
		}
		(IpAddr::V6(network), IpAddr::V6(ip)) => {
			let mask = u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0);
			u128::from(network) & mask == u128::from(ip) & mask
		}
		_ => false,
	}
}

/// Compares two addresses semantically when both parse, textually otherwise.
#[must_use]
pub fn same_ip(a: &str, b: &str) -> bool {
	match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
		(Ok(a), Ok(b)) => a == b,
		_ => a.eq_ignore_ascii_case(b),
	}
}

#[must_use]
pub fn same_mac(a: &str, b: &str) -> bool {
	a.eq_ignore_ascii_case(b)
}

/// Six colon separated hex octets.
#[must_use]
pub fn is_valid_mac(mac: &str) -> bool {
	let octets = mac.split(':').collect::<Vec<_>>();
	octets.len() == 6
		&& octets
			.iter()
			.all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}
