//! Configuration system for peersync
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (TOML when the extension is `.toml`, JSON5 otherwise)
//! 3. `PEERSYNC_MACHINE_NAME` / `PEERSYNC_DATA_DIR` environment overrides

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::SyncError;

/// Default chunk size in bytes (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

/// Process-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Name this machine publishes its update files under (no `-` allowed)
	pub machine_name: String,

	/// Human readable user name, published in profile files
	pub user_name: String,

	/// Directory holding the metadata database and the chunk cache
	pub data_dir: PathBuf,

	/// Log level used when RUST_LOG is not set
	pub log_level: String,

	// ========================================================================
	// INTERVALS
	// ========================================================================
	/// Seconds between synchronization cycles
	pub sync_interval_secs: u64,

	/// Seconds between change manager runs
	pub apply_interval_secs: u64,

	/// Seconds between periodic full-tree rescans
	pub tree_search_interval_secs: u64,

	/// Seconds the uploader trusts its cached remote listing
	pub remote_list_ttl_secs: u64,

	// ========================================================================
	// PROFILES
	// ========================================================================
	pub profiles: Vec<ProfileConfig>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			machine_name: default_machine_name(),
			user_name: std::env::var("USER").unwrap_or_else(|_| "user".to_string()),
			data_dir: std::env::var("HOME")
				.ok()
				.map(|h| PathBuf::from(h).join(".peersync"))
				.unwrap_or_else(|| PathBuf::from(".peersync")),
			log_level: "info".to_string(),
			sync_interval_secs: 10,
			apply_interval_secs: 5,
			tree_search_interval_secs: 60,
			remote_list_ttl_secs: 60,
			profiles: vec![],
		}
	}
}

impl Config {
	/// Load configuration from a TOML or JSON5 file
	pub fn load(path: &Path) -> Result<Config, SyncError> {
		let text = std::fs::read_to_string(path)?;
		let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => toml::from_str(&text)
				.map_err(|e| SyncError::InvalidConfig { message: e.to_string() })?,
			_ => json5::from_str(&text)
				.map_err(|e| SyncError::InvalidConfig { message: e.to_string() })?,
		};

		if let Ok(name) = std::env::var("PEERSYNC_MACHINE_NAME") {
			config.machine_name = name;
		}
		if let Ok(dir) = std::env::var("PEERSYNC_DATA_DIR") {
			config.data_dir = PathBuf::from(dir);
		}

		config.validate()?;
		Ok(config)
	}

	/// Check the constraints serde cannot express
	pub fn validate(&self) -> Result<(), SyncError> {
		if self.machine_name.is_empty() || self.machine_name.contains('-') {
			return Err(SyncError::InvalidConfig {
				message: format!("machine name '{}' must be non-empty and contain no '-'", self.machine_name),
			});
		}

		let mut remote_ids = HashSet::new();
		for profile in &self.profiles {
			if profile.folders.is_empty() {
				return Err(SyncError::InvalidConfig {
					message: format!("profile '{}' has no folders", profile.name),
				});
			}
			if profile.repository.chunk_size == 0 {
				return Err(SyncError::InvalidConfig {
					message: format!("profile '{}' has a zero chunk size", profile.name),
				});
			}
			for folder in &profile.folders {
				if !remote_ids.insert(folder.remote_id.clone()) {
					return Err(SyncError::InvalidConfig {
						message: format!("duplicate remote id '{}'", folder.remote_id),
					});
				}
			}
		}
		Ok(())
	}

	/// Find a profile by name
	pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
		self.profiles.iter().find(|p| p.name == name)
	}

	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join("metadata.redb")
	}

	pub fn cache_dir(&self) -> PathBuf {
		self.data_dir.join("cache")
	}

	pub fn sync_interval(&self) -> Duration {
		Duration::from_secs(self.sync_interval_secs)
	}

	pub fn apply_interval(&self) -> Duration {
		Duration::from_secs(self.apply_interval_secs)
	}

	pub fn tree_search_interval(&self) -> Duration {
		Duration::from_secs(self.tree_search_interval_secs)
	}

	pub fn remote_list_ttl(&self) -> Duration {
		Duration::from_secs(self.remote_list_ttl_secs)
	}
}

fn default_machine_name() -> String {
	let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
	name.replace('-', "_")
}

// ============================================================================
// NESTED CONFIGURATION STRUCTS
// ============================================================================

/// One synchronized set of folders sharing a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileConfig {
	pub name: String,

	/// Disabled profiles are loaded but never started
	pub enabled: bool,

	pub repository: RepositoryConfig,

	pub folders: Vec<FolderConfig>,
}

impl Default for ProfileConfig {
	fn default() -> Self {
		ProfileConfig {
			name: "default".to_string(),
			enabled: true,
			repository: RepositoryConfig::default(),
			folders: vec![],
		}
	}
}

/// A local folder bound to a repository-wide remote id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderConfig {
	pub remote_id: String,
	pub local_path: PathBuf,
}

/// Repository settings shared by every machine of a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryConfig {
	/// Chunk size in bytes (target size for content-defined chunking)
	pub chunk_size: usize,

	pub chunker: ChunkerKind,

	pub compression: Compression,

	pub connection: ConnectionConfig,
}

impl Default for RepositoryConfig {
	fn default() -> Self {
		RepositoryConfig {
			chunk_size: DEFAULT_CHUNK_SIZE,
			chunker: ChunkerKind::default(),
			compression: Compression::default(),
			connection: ConnectionConfig::Local { path: PathBuf::from("repository") },
		}
	}
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConnectionConfig {
	/// A directory on a locally mounted filesystem
	Local { path: PathBuf },
}

impl fmt::Display for ConnectionConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConnectionConfig::Local { path } => write!(f, "local:{}", path.display()),
		}
	}
}

// ============================================================================
// ENUMERATIONS
// ============================================================================

/// Chunking algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkerKind {
	/// Fixed-size blocks
	#[default]
	Fixed,
	/// Two-threshold content-defined chunking
	Tttd,
}

impl FromStr for ChunkerKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"fixed" => Ok(Self::Fixed),
			"tttd" | "content-defined" => Ok(Self::Tttd),
			_ => Err(format!("Unknown chunker: {}. Valid options: fixed, tttd", s)),
		}
	}
}

impl fmt::Display for ChunkerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Fixed => write!(f, "fixed"),
			Self::Tttd => write!(f, "tttd"),
		}
	}
}

/// Payload compression applied by pack/unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
	None,
	#[default]
	Lz4,
}

impl FromStr for Compression {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"none" | "off" => Ok(Self::None),
			"lz4" => Ok(Self::Lz4),
			_ => Err(format!("Unknown compression: {}. Valid options: none, lz4", s)),
		}
	}
}

impl fmt::Display for Compression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::None => write!(f, "none"),
			Self::Lz4 => write!(f, "lz4"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn profile_with(remote_id: &str) -> ProfileConfig {
		ProfileConfig {
			name: "work".to_string(),
			folders: vec![FolderConfig {
				remote_id: remote_id.to_string(),
				local_path: PathBuf::from("/tmp/work"),
			}],
			..ProfileConfig::default()
		}
	}

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.sync_interval_secs, 10);
		assert_eq!(config.apply_interval_secs, 5);
		assert_eq!(config.tree_search_interval_secs, 60);
		assert!(!config.machine_name.contains('-'));
	}

	#[test]
	fn test_load_toml() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("peersync.toml");
		std::fs::write(
			&path,
			r#"
machineName = "laptop"
dataDir = "/var/lib/peersync"

[[profiles]]
name = "docs"

[profiles.repository]
chunkSize = 65536
chunker = "tttd"
connection = { type = "local", path = "/mnt/share/docs" }

[[profiles.folders]]
remoteId = "docs1"
localPath = "/home/me/Docs"
"#,
		)
		.unwrap();

		let config = Config::load(&path).unwrap();
		assert_eq!(config.machine_name, "laptop");
		let profile = config.profile("docs").unwrap();
		assert!(profile.enabled);
		assert_eq!(profile.repository.chunk_size, 65536);
		assert_eq!(profile.repository.chunker, ChunkerKind::Tttd);
		assert_eq!(profile.repository.compression, Compression::Lz4);
		assert_eq!(
			profile.repository.connection,
			ConnectionConfig::Local { path: PathBuf::from("/mnt/share/docs") }
		);
		assert_eq!(profile.folders[0].remote_id, "docs1");
	}

	#[test]
	fn test_load_json5() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("peersync.json5");
		std::fs::write(
			&path,
			r#"{
	machineName: "desk",
	profiles: [{
		name: "music",
		repository: { compression: "none", connection: { type: "local", path: "/srv/music" } },
		folders: [{ remoteId: "m1", localPath: "/home/me/Music" }],
	}],
}"#,
		)
		.unwrap();

		let config = Config::load(&path).unwrap();
		let profile = config.profile("music").unwrap();
		assert_eq!(profile.repository.compression, Compression::None);
		assert_eq!(profile.repository.chunk_size, DEFAULT_CHUNK_SIZE);
	}

	#[test]
	fn test_validate_rejects_dash_in_machine_name() {
		let config = Config { machine_name: "my-laptop".to_string(), ..Config::default() };
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_validate_rejects_duplicate_remote_ids() {
		let mut second = profile_with("shared");
		second.name = "other".to_string();
		let config = Config {
			machine_name: "box".to_string(),
			profiles: vec![profile_with("shared"), second],
			..Config::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_enum_parsing() {
		assert_eq!("TTTD".parse::<ChunkerKind>().unwrap(), ChunkerKind::Tttd);
		assert_eq!("off".parse::<Compression>().unwrap(), Compression::None);
		assert!("zip".parse::<Compression>().is_err());
		assert_eq!(ChunkerKind::Fixed.to_string(), "fixed");
	}
}

// vim: ts=4
