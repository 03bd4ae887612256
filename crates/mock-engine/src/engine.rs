use std::{
	collections::{BTreeMap, HashSet},
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::trace;

use super::model::{FibAction, InterfaceKind, DEFAULT_MTU};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	#[error("interface not found <sw_if_index='{0}'>")]
	InterfaceNotFound(u32),
	#[error("interface still in use <sw_if_index='{0}'>: {1}")]
	InterfaceInUse(u32, &'static str),
	#[error("bridge domain not found <bd_id='{0}'>")]
	BridgeDomainNotFound(u32),
	#[error("bridge domain already exists <bd_id='{0}'>")]
	BridgeDomainExists(u32),
	#[error("bridge domain still has members <bd_id='{0}'>")]
	BridgeDomainInUse(u32),
	#[error("entry not found <entry='{0}'>")]
	EntryNotFound(String),
	#[error("injected failure <call='{0}'>")]
	Injected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInterface {
	/// Name given by whoever created the interface, if any.
	pub tag: Option<String>,
	pub kind: InterfaceKind,
	pub enabled: bool,
	pub mtu: u32,
	pub mac: String,
	pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBridgeDomain {
	pub tag: String,
	pub flood: bool,
	pub learn: bool,
	pub forward: bool,
	/// (ip, mac)
	pub arp_termination: Vec<(String, String)>,
	/// `sw_if_index` to whether the interface is the BVI.
	pub members: BTreeMap<u32, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineArp {
	pub sw_if_index: u32,
	pub ip: String,
	pub mac: String,
	pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFib {
	pub bd_id: u32,
	pub mac: String,
	pub action: FibAction,
	pub sw_if_index: Option<u32>,
	pub bvi: bool,
	pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRoute {
	pub vrf: u32,
	pub dst: String,
	pub gw: Option<String>,
	pub sw_if_index: Option<u32>,
	pub weight: u32,
}

#[derive(Debug, Default)]
struct EngineState {
	interfaces: BTreeMap<u32, EngineInterface>,
	next_sw_if_index: u32,
	bridge_domains: BTreeMap<u32, EngineBridgeDomain>,
	arps: BTreeMap<(u32, String), EngineArp>,
	fibs: BTreeMap<(u32, String), EngineFib>,
	routes: BTreeMap<(u32, String, Option<String>), EngineRoute>,
	xconnects: BTreeMap<u32, u32>,
}

impl EngineState {
	fn interface_mut(&mut self, sw_if_index: u32) -> Result<&mut EngineInterface, EngineError> {
		self.interfaces
			.get_mut(&sw_if_index)
			.ok_or(EngineError::InterfaceNotFound(sw_if_index))
	}

	fn check_interface(&self, sw_if_index: u32) -> Result<(), EngineError> {
		if self.interfaces.contains_key(&sw_if_index) {
			Ok(())
		} else {
			Err(EngineError::InterfaceNotFound(sw_if_index))
		}
	}

	fn bridge_domain_mut(&mut self, bd_id: u32) -> Result<&mut EngineBridgeDomain, EngineError> {
		self.bridge_domains
			.get_mut(&bd_id)
			.ok_or(EngineError::BridgeDomainNotFound(bd_id))
	}
}

/// In-memory stand-in for a packet forwarding engine.
///
/// Objects reference each other by the numeric handles the engine allocates (`sw_if_index`,
/// `bd_id`), exactly like a real dataplane would. Every call is logged, can be delayed by a
/// configurable latency and can be made to fail on demand.
#[derive(Debug)]
pub struct MockEngine {
	state: Mutex<EngineState>,
	calls: Mutex<Vec<String>>,
	failing: Mutex<HashSet<String>>,
	latency_ms: AtomicU64,
}

impl Default for MockEngine {
	fn default() -> Self {
		Self::new()
	}
}

impl MockEngine {
	/// An engine holding only its `local0` interface, at `sw_if_index` 0.
	#[must_use]
	pub fn new() -> Self {
		let mut state = EngineState::default();
		state.interfaces.insert(
			0,
			EngineInterface {
				tag: None,
				kind: InterfaceKind::Local,
				enabled: false,
				mtu: 0,
				mac: "00:00:00:00:00:00".to_string(),
				addresses: Vec::new(),
			},
		);
		state.next_sw_if_index = 1;

		Self {
			state: Mutex::new(state),
			calls: Mutex::default(),
			failing: Mutex::default(),
			latency_ms: AtomicU64::new(0),
		}
	}

	#[must_use]
	pub fn with_latency(latency: Duration) -> Self {
		let engine = Self::new();
		engine.set_latency(latency);
		engine
	}

	#[allow(clippy::cast_possible_truncation)]
	pub fn set_latency(&self, latency: Duration) {
		self.latency_ms
			.store(latency.as_millis() as u64, Ordering::Relaxed);
	}

	/// Makes every call matching `pattern` fail, either a call name (`add_interface`) or a call
	/// with its target as logged (`add_interface tap0`).
	pub fn fail_on(&self, pattern: impl Into<String>) {
		self.failing.lock().insert(pattern.into());
	}

	pub fn heal(&self, pattern: &str) {
		self.failing.lock().remove(pattern);
	}

	/// Calls made so far, as `<call> <target>`.
	#[must_use]
	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().clone()
	}

	pub fn take_calls(&self) -> Vec<String> {
		std::mem::take(&mut *self.calls.lock())
	}

	async fn call<T>(
		&self,
		name: &str,
		target: String,
		f: impl FnOnce(&mut EngineState) -> Result<T, EngineError> + Send,
	) -> Result<T, EngineError> {
		let latency = self.latency_ms.load(Ordering::Relaxed);
		if latency > 0 {
			sleep(Duration::from_millis(latency)).await;
		}

		let call = if target.is_empty() {
			name.to_string()
		} else {
			format!("{name} {target}")
		};
		trace!(%call, "Engine call");
		self.calls.lock().push(call.clone());

		let injected = {
			let failing = self.failing.lock();
			failing.contains(name) || failing.contains(&call)
		};
		if injected {
			return Err(EngineError::Injected(call));
		}

		f(&mut self.state.lock())
	}

	pub async fn add_interface(
		&self,
		tag: &str,
		kind: InterfaceKind,
		mac: Option<&str>,
	) -> Result<u32, EngineError> {
		let tag = tag.to_string();
		let mac = mac.map(ToString::to_string);

		self.call("add_interface", tag.clone(), move |state| {
			let sw_if_index = state.next_sw_if_index;
			state.next_sw_if_index += 1;

			state.interfaces.insert(
				sw_if_index,
				EngineInterface {
					tag: Some(tag),
					kind,
					enabled: false,
					mtu: DEFAULT_MTU,
					mac: mac.unwrap_or_else(|| format!("02:fe:00:00:00:{:02x}", sw_if_index % 256)),
					addresses: Vec::new(),
				},
			);

			Ok(sw_if_index)
		})
		.await
	}

	pub async fn delete_interface(&self, sw_if_index: u32) -> Result<(), EngineError> {
		self.call("delete_interface", sw_if_index.to_string(), move |state| {
			state.check_interface(sw_if_index)?;

			if state
				.bridge_domains
				.values()
				.any(|bd| bd.members.contains_key(&sw_if_index))
			{
				return Err(EngineError::InterfaceInUse(sw_if_index, "bridge domain member"));
			}
			if state
				.xconnects
				.iter()
				.any(|(rx, tx)| *rx == sw_if_index || *tx == sw_if_index)
			{
				return Err(EngineError::InterfaceInUse(sw_if_index, "cross-connected"));
			}

			state.interfaces.remove(&sw_if_index);
			state.arps.retain(|(index, _), _| *index != sw_if_index);
			Ok(())
		})
		.await
	}

	pub async fn set_interface_enabled(
		&self,
		sw_if_index: u32,
		enabled: bool,
	) -> Result<(), EngineError> {
		self.call(
			"set_interface_enabled",
			format!("{sw_if_index} {enabled}"),
			move |state| {
				state.interface_mut(sw_if_index)?.enabled = enabled;
				Ok(())
			},
		)
		.await
	}

	pub async fn set_interface_mtu(&self, sw_if_index: u32, mtu: u32) -> Result<(), EngineError> {
		self.call("set_interface_mtu", format!("{sw_if_index} {mtu}"), move |state| {
			state.interface_mut(sw_if_index)?.mtu = mtu;
			Ok(())
		})
		.await
	}

	pub async fn set_interface_mac(&self, sw_if_index: u32, mac: &str) -> Result<(), EngineError> {
		let mac = mac.to_string();
		self.call("set_interface_mac", format!("{sw_if_index} {mac}"), move |state| {
			state.interface_mut(sw_if_index)?.mac = mac;
			Ok(())
		})
		.await
	}

	pub async fn add_interface_address(
		&self,
		sw_if_index: u32,
		address: &str,
	) -> Result<(), EngineError> {
		let address = address.to_string();
		self.call(
			"add_interface_address",
			format!("{sw_if_index} {address}"),
			move |state| {
				let interface = state.interface_mut(sw_if_index)?;
				if !interface.addresses.contains(&address) {
					interface.addresses.push(address);
				}
				Ok(())
			},
		)
		.await
	}

	pub async fn del_interface_address(
		&self,
		sw_if_index: u32,
		address: &str,
	) -> Result<(), EngineError> {
		let address = address.to_string();
		self.call(
			"del_interface_address",
			format!("{sw_if_index} {address}"),
			move |state| {
				state
					.interface_mut(sw_if_index)?
					.addresses
					.retain(|current| *current != address);
				Ok(())
			},
		)
		.await
	}

	pub async fn dump_interfaces(&self) -> Result<Vec<(u32, EngineInterface)>, EngineError> {
		self.call("dump_interfaces", String::new(), |state| {
			Ok(state
				.interfaces
				.iter()
				.map(|(index, interface)| (*index, interface.clone()))
				.collect())
		})
		.await
	}

	pub async fn add_bridge_domain(
		&self,
		bd_id: u32,
		tag: &str,
		flood: bool,
		learn: bool,
		forward: bool,
	) -> Result<(), EngineError> {
		let tag = tag.to_string();
		self.call("add_bridge_domain", format!("{bd_id} {tag}"), move |state| {
			if state.bridge_domains.contains_key(&bd_id) {
				return Err(EngineError::BridgeDomainExists(bd_id));
			}

			state.bridge_domains.insert(
				bd_id,
				EngineBridgeDomain {
					tag,
					flood,
					learn,
					forward,
					arp_termination: Vec::new(),
					members: BTreeMap::new(),
				},
			);
			Ok(())
		})
		.await
	}

	pub async fn delete_bridge_domain(&self, bd_id: u32) -> Result<(), EngineError> {
		self.call("delete_bridge_domain", bd_id.to_string(), move |state| {
			if !state.bridge_domain_mut(bd_id)?.members.is_empty() {
				return Err(EngineError::BridgeDomainInUse(bd_id));
			}

			state.bridge_domains.remove(&bd_id);
			state.fibs.retain(|(id, _), _| *id != bd_id);
			Ok(())
		})
		.await
	}

	pub async fn add_arp_termination(
		&self,
		bd_id: u32,
		ip: &str,
		mac: &str,
	) -> Result<(), EngineError> {
		let (ip, mac) = (ip.to_string(), mac.to_string());
		self.call(
			"add_arp_termination",
			format!("{bd_id} {ip} {mac}"),
			move |state| {
				let bd = state.bridge_domain_mut(bd_id)?;
				bd.arp_termination.retain(|(current, _)| *current != ip);
				bd.arp_termination.push((ip, mac));
				Ok(())
			},
		)
		.await
	}

	pub async fn remove_arp_termination(&self, bd_id: u32, ip: &str) -> Result<(), EngineError> {
		let ip = ip.to_string();
		self.call("remove_arp_termination", format!("{bd_id} {ip}"), move |state| {
			state
				.bridge_domain_mut(bd_id)?
				.arp_termination
				.retain(|(current, _)| *current != ip);
			Ok(())
		})
		.await
	}

	pub async fn add_bd_member(
		&self,
		bd_id: u32,
		sw_if_index: u32,
		bvi: bool,
	) -> Result<(), EngineError> {
		self.call("add_bd_member", format!("{bd_id} {sw_if_index}"), move |state| {
			state.check_interface(sw_if_index)?;
			state
				.bridge_domain_mut(bd_id)?
				.members
				.insert(sw_if_index, bvi);
			Ok(())
		})
		.await
	}

	pub async fn remove_bd_member(&self, bd_id: u32, sw_if_index: u32) -> Result<(), EngineError> {
		self.call(
			"remove_bd_member",
			format!("{bd_id} {sw_if_index}"),
			move |state| {
				state
					.bridge_domain_mut(bd_id)?
					.members
					.remove(&sw_if_index)
					.map(|_| ())
					.ok_or_else(|| {
						EngineError::EntryNotFound(format!("member {sw_if_index} of {bd_id}"))
					})
			},
		)
		.await
	}

	pub async fn dump_bridge_domains(
		&self,
	) -> Result<Vec<(u32, EngineBridgeDomain)>, EngineError> {
		self.call("dump_bridge_domains", String::new(), |state| {
			Ok(state
				.bridge_domains
				.iter()
				.map(|(id, bd)| (*id, bd.clone()))
				.collect())
		})
		.await
	}

	pub async fn add_arp(&self, arp: EngineArp) -> Result<(), EngineError> {
		self.call(
			"add_arp",
			format!("{} {}", arp.sw_if_index, arp.ip),
			move |state| {
				state.check_interface(arp.sw_if_index)?;
				state.arps.insert((arp.sw_if_index, arp.ip.clone()), arp);
				Ok(())
			},
		)
		.await
	}

	pub async fn delete_arp(&self, sw_if_index: u32, ip: &str) -> Result<(), EngineError> {
		let ip = ip.to_string();
		self.call("delete_arp", format!("{sw_if_index} {ip}"), move |state| {
			let entry = format!("arp {sw_if_index} {ip}");
			state
				.arps
				.remove(&(sw_if_index, ip))
				.map(|_| ())
				.ok_or(EngineError::EntryNotFound(entry))
		})
		.await
	}

	pub async fn dump_arps(&self) -> Result<Vec<EngineArp>, EngineError> {
		self.call("dump_arps", String::new(), |state| {
			Ok(state.arps.values().cloned().collect())
		})
		.await
	}

	pub async fn add_fib(&self, fib: EngineFib) -> Result<(), EngineError> {
		self.call("add_fib", format!("{} {}", fib.bd_id, fib.mac), move |state| {
			state.bridge_domain_mut(fib.bd_id)?;
			if let Some(sw_if_index) = fib.sw_if_index {
				state.check_interface(sw_if_index)?;
			}
			state.fibs.insert((fib.bd_id, fib.mac.clone()), fib);
			Ok(())
		})
		.await
	}

	pub async fn delete_fib(&self, bd_id: u32, mac: &str) -> Result<(), EngineError> {
		let mac = mac.to_string();
		self.call("delete_fib", format!("{bd_id} {mac}"), move |state| {
			let entry = format!("fib {bd_id} {mac}");
			state
				.fibs
				.remove(&(bd_id, mac))
				.map(|_| ())
				.ok_or(EngineError::EntryNotFound(entry))
		})
		.await
	}

	pub async fn dump_fibs(&self) -> Result<Vec<EngineFib>, EngineError> {
		self.call("dump_fibs", String::new(), |state| {
			Ok(state.fibs.values().cloned().collect())
		})
		.await
	}

	pub async fn add_route(&self, route: EngineRoute) -> Result<(), EngineError> {
		self.call(
			"add_route",
			format!("{} {}", route.vrf, route.dst),
			move |state| {
				if let Some(sw_if_index) = route.sw_if_index {
					state.check_interface(sw_if_index)?;
				}
				state
					.routes
					.insert((route.vrf, route.dst.clone(), route.gw.clone()), route);
				Ok(())
			},
		)
		.await
	}

	pub async fn delete_route(
		&self,
		vrf: u32,
		dst: &str,
		gw: Option<&str>,
	) -> Result<(), EngineError> {
		let (dst, gw) = (dst.to_string(), gw.map(ToString::to_string));
		self.call("delete_route", format!("{vrf} {dst}"), move |state| {
			let entry = format!("route {vrf} {dst}");
			state
				.routes
				.remove(&(vrf, dst, gw))
				.map(|_| ())
				.ok_or(EngineError::EntryNotFound(entry))
		})
		.await
	}

	pub async fn dump_routes(&self) -> Result<Vec<EngineRoute>, EngineError> {
		self.call("dump_routes", String::new(), |state| {
			Ok(state.routes.values().cloned().collect())
		})
		.await
	}

	pub async fn set_xconnect(&self, rx: u32, tx: u32) -> Result<(), EngineError> {
		self.call("set_xconnect", format!("{rx} {tx}"), move |state| {
			state.check_interface(rx)?;
			state.check_interface(tx)?;
			state.xconnects.insert(rx, tx);
			Ok(())
		})
		.await
	}

	pub async fn delete_xconnect(&self, rx: u32) -> Result<(), EngineError> {
		self.call("delete_xconnect", rx.to_string(), move |state| {
			state
				.xconnects
				.remove(&rx)
				.map(|_| ())
				.ok_or_else(|| EngineError::EntryNotFound(format!("xconnect {rx}")))
		})
		.await
	}

	pub async fn dump_xconnects(&self) -> Result<Vec<(u32, u32)>, EngineError> {
		self.call("dump_xconnects", String::new(), |state| {
			Ok(state.xconnects.iter().map(|(rx, tx)| (*rx, *tx)).collect())
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_local0_is_always_there() {
		let engine = MockEngine::new();

		let interfaces = engine.dump_interfaces().await.unwrap();
		assert_eq!(interfaces.len(), 1);
		assert_eq!(interfaces[0].0, 0);
		assert_eq!(interfaces[0].1.kind, InterfaceKind::Local);
		assert_eq!(interfaces[0].1.tag, None);
	}

	#[tokio::test]
	async fn test_handles_are_allocated_sequentially() {
		let engine = MockEngine::new();

		let first = engine
			.add_interface("tap0", InterfaceKind::Tap, None)
			.await
			.unwrap();
		let second = engine
			.add_interface("tap1", InterfaceKind::Tap, Some("aa:bb:cc:dd:ee:ff"))
			.await
			.unwrap();

		assert_eq!((first, second), (1, 2));

		let interfaces = engine.dump_interfaces().await.unwrap();
		assert_eq!(interfaces[1].1.mac, "02:fe:00:00:00:01");
		assert_eq!(interfaces[2].1.mac, "aa:bb:cc:dd:ee:ff");
	}

	#[tokio::test]
	async fn test_members_block_removal() {
		let engine = MockEngine::new();

		let tap = engine
			.add_interface("tap0", InterfaceKind::Tap, None)
			.await
			.unwrap();
		engine
			.add_bridge_domain(1, "b1", true, true, true)
			.await
			.unwrap();
		engine.add_bd_member(1, tap, false).await.unwrap();

		assert!(matches!(
			engine.delete_interface(tap).await,
			Err(EngineError::InterfaceInUse(..))
		));
		assert!(matches!(
			engine.delete_bridge_domain(1).await,
			Err(EngineError::BridgeDomainInUse(1))
		));

		engine.remove_bd_member(1, tap).await.unwrap();
		engine.delete_bridge_domain(1).await.unwrap();
		engine.delete_interface(tap).await.unwrap();
	}

	#[tokio::test]
	async fn test_injected_failures() {
		let engine = MockEngine::new();
		engine.fail_on("add_interface tap1");

		engine
			.add_interface("tap0", InterfaceKind::Tap, None)
			.await
			.unwrap();
		assert!(matches!(
			engine.add_interface("tap1", InterfaceKind::Tap, None).await,
			Err(EngineError::Injected(call)) if call == "add_interface tap1"
		));

		engine.heal("add_interface tap1");
		engine
			.add_interface("tap1", InterfaceKind::Tap, None)
			.await
			.unwrap();

		assert_eq!(
			engine.calls(),
			vec![
				"add_interface tap0",
				"add_interface tap1",
				"add_interface tap1"
			]
		);
	}
}
