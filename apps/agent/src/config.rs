//! Agent configuration

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{anyhow, Context, Result};
use nca_scheduler::{ResyncStrategy, SchedulerConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const CONFIG_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
	/// Config schema version
	pub version: u32,

	/// Default log filter, `RUST_LOG` takes precedence
	pub log_level: String,

	/// JSON object mapping keys to the desired value of each configuration object
	pub desired_state: PathBuf,

	/// Quiet period after the last change notification before the desired-state file is reread
	pub debounce_ms: u64,

	/// Refresh applied on the first desired-state snapshot
	pub startup_resync: ResyncStrategy,

	/// Periodic resync against the forwarding engine, 0 disables it
	pub resync_interval_secs: u64,

	pub periodic_resync: ResyncStrategy,

	pub scheduler: SchedulerConfig,

	/// Simulated latency of every forwarding engine call
	pub engine_latency_ms: u64,
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self {
			version: CONFIG_VERSION,
			log_level: "info".to_string(),
			desired_state: PathBuf::from("desired-state.json"),
			debounce_ms: 100,
			startup_resync: ResyncStrategy::Full,
			resync_interval_secs: 300,
			periodic_resync: ResyncStrategy::Full,
			scheduler: SchedulerConfig::default(),
			engine_latency_ms: 0,
		}
	}
}

impl AgentConfig {
	/// Loads the configuration at `path`, writing the defaults there first if it doesn't exist.
	pub fn load_or_create(path: &Path) -> Result<Self> {
		if !path.exists() {
			warn!(?path, "No config found, creating default");
			let config = Self::default();
			config.save(path)?;
			return Ok(config);
		}

		info!(?path, "Loading config");
		let json = fs::read_to_string(path)
			.with_context(|| format!("failed to read config at {}", path.display()))?;
		let mut config: Self = serde_json::from_str(&json)
			.with_context(|| format!("malformed config at {}", path.display()))?;

		if config.version < CONFIG_VERSION {
			info!(
				from = config.version,
				to = CONFIG_VERSION,
				"Migrating config"
			);
			config.migrate()?;
			config.save(path)?;
		}

		config.check()?;

		Ok(config)
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
			fs::create_dir_all(parent)?;
		}

		fs::write(path, serde_json::to_string_pretty(self)?)?;
		info!(?path, "Saved config");

		Ok(())
	}

	fn migrate(&mut self) -> Result<()> {
		loop {
			match self.version {
				// v1 had no periodic resync strategy of its own and reused the startup one.
				0 | 1 => {
					self.periodic_resync = self.startup_resync;
					self.version = 2;
				}
				// v2 polled the desired-state file, its poll interval is simply dropped.
				2 => self.version = 3,
				CONFIG_VERSION => return Ok(()),
				v => return Err(anyhow!("unknown config version: {v}")),
			}
		}
	}

	fn check(&self) -> Result<()> {
		if self.version > CONFIG_VERSION {
			return Err(anyhow!(
				"config version {} is newer than supported version {CONFIG_VERSION}",
				self.version
			));
		}

		Ok(())
	}

	#[must_use]
	pub const fn debounce(&self) -> Duration {
		Duration::from_millis(self.debounce_ms)
	}

	#[must_use]
	pub const fn resync_interval(&self) -> Option<Duration> {
		if self.resync_interval_secs == 0 {
			None
		} else {
			Some(Duration::from_secs(self.resync_interval_secs))
		}
	}

	#[must_use]
	pub const fn engine_latency(&self) -> Duration {
		Duration::from_millis(self.engine_latency_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use tempfile::tempdir;

	#[test]
	fn test_default_config_is_created() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("agent").join("config.json");

		let config = AgentConfig::load_or_create(&path).unwrap();

		assert_eq!(config, AgentConfig::default());
		assert!(path.exists());
		assert_eq!(AgentConfig::load_or_create(&path).unwrap(), config);
	}

	#[test]
	fn test_old_config_is_migrated() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("config.json");
		fs::write(
			&path,
			r#"{"version": 1, "startup_resync": "optimized", "scheduler": {"history_capacity": 10}}"#,
		)
		.unwrap();

		let config = AgentConfig::load_or_create(&path).unwrap();

		assert_eq!(config.version, CONFIG_VERSION);
		assert_eq!(config.periodic_resync, ResyncStrategy::Optimized);
		assert_eq!(config.scheduler.history_capacity, 10);
		assert_eq!(config.scheduler.queue_capacity, 100);

		let saved: AgentConfig =
			serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
		assert_eq!(saved.version, CONFIG_VERSION);
	}

	#[test]
	fn test_polling_config_is_migrated() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("config.json");
		fs::write(
			&path,
			r#"{"version": 2, "poll_interval_ms": 250, "periodic_resync": "skip"}"#,
		)
		.unwrap();

		let config = AgentConfig::load_or_create(&path).unwrap();

		assert_eq!(config.version, CONFIG_VERSION);
		assert_eq!(config.debounce_ms, 100);
		assert_eq!(config.periodic_resync, ResyncStrategy::Skip);
		assert!(!fs::read_to_string(&path).unwrap().contains("poll_interval_ms"));
	}

	#[test]
	fn test_newer_config_is_rejected() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("config.json");
		fs::write(&path, r#"{"version": 99}"#).unwrap();

		assert!(AgentConfig::load_or_create(&path).is_err());
	}

	#[test]
	fn test_zero_interval_disables_periodic_resync() {
		let config = AgentConfig {
			resync_interval_secs: 0,
			..Default::default()
		};

		assert_eq!(config.resync_interval(), None);
	}
}
