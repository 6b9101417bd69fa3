use std::time::Duration;

use log::Level;
use serde::Deserialize;
use thiserror::Error;

use crate::error::SyncError;
use crate::offline::OverflowPolicy;
use crate::queue::QueueOptions;

/// Validated construction-time options for the sync engine.
///
/// Built once and rejected early: invalid combinations fail at construction,
/// never at first use.
#[derive(Debug, Clone)]
pub struct SyncOptions {
	/// Consecutive failed opens before the connection is `Failed`.
	pub reconnect_attempts: u32,
	/// Base reconnect delay; the n-th retry waits `reconnect_delay * n`.
	pub reconnect_delay: Duration,
	/// Cap on the scaled reconnect delay.
	pub max_reconnect_delay: Duration,
	pub heartbeat_interval: Duration,
	/// Missing a heartbeat response for this long forces a reconnect.
	pub heartbeat_timeout: Duration,
	/// Work queue debounce window (see `SyncQueueManager`).
	pub sync_interval: Duration,
	pub batch_size: usize,
	pub max_queue_size: usize,
	/// Bounded offline frame buffer depth.
	pub offline_buffer_size: usize,
	pub overflow_policy: OverflowPolicy,
	/// Work queue retry budget per item.
	pub max_attempts: u32,
	/// Default conflict strategy name; validated when the resolver is built.
	pub conflict_strategy: String,
	pub enable_offline_mode: bool,
	pub force_sync_timeout: Duration,
}

impl Default for SyncOptions {
	fn default() -> Self {
		Self {
			reconnect_attempts: 5,
			reconnect_delay: Duration::from_millis(1000),
			max_reconnect_delay: Duration::from_millis(30_000),
			heartbeat_interval: Duration::from_millis(30_000),
			heartbeat_timeout: Duration::from_millis(10_000),
			sync_interval: Duration::from_millis(5000),
			batch_size: 100,
			max_queue_size: 1000,
			offline_buffer_size: 512,
			overflow_policy: OverflowPolicy::DropOldest,
			max_attempts: 3,
			conflict_strategy: "merge".to_string(),
			enable_offline_mode: true,
			force_sync_timeout: Duration::from_millis(10_000),
		}
	}
}

impl SyncOptions {
	/// Reject invalid combinations up front.
	pub fn validate(&self) -> Result<(), SyncError> {
		if self.reconnect_attempts == 0 {
			return Err(SyncError::InvalidConfig(
				"reconnect_attempts must be positive".to_string(),
			));
		}
		if self.batch_size == 0 {
			return Err(SyncError::InvalidConfig(
				"batch_size must be positive".to_string(),
			));
		}
		if self.max_queue_size == 0 {
			return Err(SyncError::InvalidConfig(
				"max_queue_size must be positive".to_string(),
			));
		}
		if self.offline_buffer_size == 0 {
			return Err(SyncError::InvalidConfig(
				"offline_buffer_size must be positive".to_string(),
			));
		}
		if self.max_attempts == 0 {
			return Err(SyncError::InvalidConfig(
				"max_attempts must be positive".to_string(),
			));
		}
		for (name, duration) in [
			("reconnect_delay", self.reconnect_delay),
			("heartbeat_interval", self.heartbeat_interval),
			("heartbeat_timeout", self.heartbeat_timeout),
			("sync_interval", self.sync_interval),
			("force_sync_timeout", self.force_sync_timeout),
		] {
			if duration.is_zero() {
				return Err(SyncError::InvalidConfig(format!(
					"{} must be positive",
					name
				)));
			}
		}
		Ok(())
	}

	pub fn queue_options(&self) -> QueueOptions {
		QueueOptions {
			batch_size: self.batch_size,
			batch_timeout: self.sync_interval,
			max_queue_size: self.max_queue_size,
			max_attempts: self.max_attempts,
		}
	}
}

/// Bootstrap configuration for the `bifrost-sync` binary.
///
/// Values are loaded from (in order): `/etc/bifrost/sync.json`, a
/// `bifrost/sync.json` file in the user config folders (optional), and
/// environment variables prefixed with `BFS_` (e.g. `BFS_SERVER_ADDR`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	pub server_addr: String,
	pub client_id: String,
	pub log_level: Level,
	pub reconnect_attempts: u32,
	pub reconnect_delay_ms: u64,
	pub max_reconnect_delay_ms: u64,
	pub heartbeat_interval_ms: u64,
	pub heartbeat_timeout_ms: u64,
	pub sync_interval_ms: u64,
	pub batch_size: usize,
	pub max_queue_size: usize,
	pub offline_buffer_size: usize,
	pub overflow_policy: OverflowPolicy,
	pub max_attempts: u32,
	pub conflict_strategy: String,
	pub enable_offline_mode: bool,
	pub force_sync_timeout_ms: u64,
}

impl Default for Settings {
	fn default() -> Self {
		let defaults = SyncOptions::default();
		Self {
			server_addr: "127.0.0.1:9400".to_string(),
			client_id: format!("client-{}", std::process::id()),
			log_level: Level::Info,
			reconnect_attempts: defaults.reconnect_attempts,
			reconnect_delay_ms: defaults.reconnect_delay.as_millis() as u64,
			max_reconnect_delay_ms: defaults.max_reconnect_delay.as_millis() as u64,
			heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
			heartbeat_timeout_ms: defaults.heartbeat_timeout.as_millis() as u64,
			sync_interval_ms: defaults.sync_interval.as_millis() as u64,
			batch_size: defaults.batch_size,
			max_queue_size: defaults.max_queue_size,
			offline_buffer_size: defaults.offline_buffer_size,
			overflow_policy: defaults.overflow_policy,
			max_attempts: defaults.max_attempts,
			conflict_strategy: defaults.conflict_strategy,
			enable_offline_mode: defaults.enable_offline_mode,
			force_sync_timeout_ms: defaults.force_sync_timeout.as_millis() as u64,
		}
	}
}

impl Settings {
	/// Map the bootstrap settings to validated engine options.
	pub fn sync_options(&self) -> Result<SyncOptions, SyncError> {
		let opts = SyncOptions {
			reconnect_attempts: self.reconnect_attempts,
			reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
			max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay_ms),
			heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
			heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
			sync_interval: Duration::from_millis(self.sync_interval_ms),
			batch_size: self.batch_size,
			max_queue_size: self.max_queue_size,
			offline_buffer_size: self.offline_buffer_size,
			overflow_policy: self.overflow_policy,
			max_attempts: self.max_attempts,
			conflict_strategy: self.conflict_strategy.clone(),
			enable_offline_mode: self.enable_offline_mode,
			force_sync_timeout: Duration::from_millis(self.force_sync_timeout_ms),
		};
		opts.validate()?;
		Ok(opts)
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	load_from(Some("/etc/bifrost/sync.json"))
}

/// Load settings with an explicit primary file path; `None` skips the
/// system-wide file (used by tests).
pub fn load_from(system_file: Option<&str>) -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder();

	if let Some(path) = system_file {
		builder = builder.add_source(config::File::with_name(path).required(false));
	}
	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("bifrost").join("sync.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("bifrost").join("sync.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix("BFS").separator("__"));

	let cfg = builder.build()?;
	let mut s: Settings = cfg.try_deserialize()?;

	// Explicitly prefer direct environment variables when present. Some
	// environments (CI, test harnesses) may set env vars in ways that the
	// `config` crate doesn't map as expected; read them directly to ensure
	// explicit overrides take effect.
	if let Ok(addr) = std::env::var("BFS_SERVER_ADDR") {
		if !addr.is_empty() {
			s.server_addr = addr;
		}
	}
	if let Ok(id) = std::env::var("BFS_CLIENT_ID") {
		if !id.is_empty() {
			s.client_id = id;
		}
	}
	if let Ok(strategy) = std::env::var("BFS_CONFLICT_STRATEGY") {
		if !strategy.is_empty() {
			s.conflict_strategy = strategy;
		}
	}
	if let Ok(l) = std::env::var("BFS_LOG_LEVEL") {
		if !l.is_empty() {
			if let Ok(parsed) = l.parse::<Level>() {
				s.log_level = parsed;
			}
		}
	}

	Ok(s)
}
