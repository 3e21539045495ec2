//! Remote file naming and listings
//!
//! Every file on the remote store has a flat, self-describing name:
//!
//! - `chunk-<checksum>`
//! - `update-<client>-<timestamp>`
//! - `profile-<client>-<timestamp>`
//! - `image-<client>-<timestamp>`
//! - `repository-<timestamp>`
//! - `file-<checksum>-<timestamp>` (legacy, listed but never written)

use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use crate::transfer::RemoteFile;

fn name_pattern() -> Option<&'static Regex> {
	static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
	PATTERN
		.get_or_init(|| {
			Regex::new(
				r"^(?:chunk-(?P<chunk>[0-9a-f]+)|repository-(?P<repo>\d+)|(?P<kind>update|profile|image)-(?P<client>[^-]+)-(?P<ts>\d+)|file-(?P<fcs>[0-9a-f]+)-(?P<fts>\d+))$",
			)
			.ok()
		})
		.as_ref()
}

/// Parsed remote file name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteName {
	Chunk { checksum: String },
	Update { client: String, timestamp: i64 },
	Profile { client: String, timestamp: i64 },
	Image { client: String, timestamp: i64 },
	Repository { timestamp: i64 },
	LegacyFile { checksum: String, timestamp: i64 },
}

impl RemoteName {
	/// Parse a name; anything not following the naming scheme yields None
	pub fn parse(name: &str) -> Option<RemoteName> {
		let caps = name_pattern()?.captures(name)?;

		if let Some(cs) = caps.name("chunk") {
			return Some(RemoteName::Chunk { checksum: cs.as_str().to_string() });
		}
		if let Some(ts) = caps.name("repo") {
			return Some(RemoteName::Repository { timestamp: ts.as_str().parse().ok()? });
		}
		if let Some(kind) = caps.name("kind") {
			let client = caps.name("client")?.as_str().to_string();
			let timestamp = caps.name("ts")?.as_str().parse().ok()?;
			return match kind.as_str() {
				"update" => Some(RemoteName::Update { client, timestamp }),
				"profile" => Some(RemoteName::Profile { client, timestamp }),
				_ => Some(RemoteName::Image { client, timestamp }),
			};
		}
		let checksum = caps.name("fcs")?.as_str().to_string();
		let timestamp = caps.name("fts")?.as_str().parse().ok()?;
		Some(RemoteName::LegacyFile { checksum, timestamp })
	}

	pub fn update(client: &str, timestamp: i64) -> String {
		RemoteName::Update { client: client.to_string(), timestamp }.to_string()
	}

	pub fn profile(client: &str, timestamp: i64) -> String {
		RemoteName::Profile { client: client.to_string(), timestamp }.to_string()
	}

	pub fn repository(timestamp: i64) -> String {
		RemoteName::Repository { timestamp }.to_string()
	}
}

impl fmt::Display for RemoteName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RemoteName::Chunk { checksum } => write!(f, "chunk-{}", checksum),
			RemoteName::Update { client, timestamp } => write!(f, "update-{}-{}", client, timestamp),
			RemoteName::Profile { client, timestamp } => write!(f, "profile-{}-{}", client, timestamp),
			RemoteName::Image { client, timestamp } => write!(f, "image-{}-{}", client, timestamp),
			RemoteName::Repository { timestamp } => write!(f, "repository-{}", timestamp),
			RemoteName::LegacyFile { checksum, timestamp } => write!(f, "file-{}-{}", checksum, timestamp),
		}
	}
}

/// Newest file of one kind published by a remote client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFile {
	pub name: String,
	pub timestamp: i64,
}

/// A remote listing sorted by kind and owner
#[derive(Debug, Default)]
pub struct StructuredFileList {
	chunks: HashSet<String>,
	repository_files: BTreeMap<i64, String>,
	local_update_files: BTreeMap<i64, String>,
	local_profile_files: BTreeMap<i64, String>,
	local_image_files: BTreeMap<i64, String>,
	remote_update_files: BTreeMap<String, ClientFile>,
	remote_profile_files: BTreeMap<String, ClientFile>,
	remote_image_files: BTreeMap<String, ClientFile>,
	skipped: usize,
}

impl StructuredFileList {
	pub fn new(machine_name: &str, listing: &BTreeMap<String, RemoteFile>) -> Self {
		let mut list = StructuredFileList::default();
		for name in listing.keys() {
			let parsed = match RemoteName::parse(name) {
				Some(p) => p,
				None => {
					list.skipped += 1;
					continue;
				}
			};
			match parsed {
				RemoteName::Chunk { checksum } => {
					list.chunks.insert(checksum);
				}
				RemoteName::Repository { timestamp } => {
					list.repository_files.insert(timestamp, name.clone());
				}
				RemoteName::Update { client, timestamp } => {
					list.add_client_file(machine_name, Kind::Update, client, timestamp, name)
				}
				RemoteName::Profile { client, timestamp } => {
					list.add_client_file(machine_name, Kind::Profile, client, timestamp, name)
				}
				RemoteName::Image { client, timestamp } => {
					list.add_client_file(machine_name, Kind::Image, client, timestamp, name)
				}
				RemoteName::LegacyFile { .. } => {}
			}
		}
		list
	}

	fn add_client_file(&mut self, machine_name: &str, kind: Kind, client: String, timestamp: i64, name: &str) {
		let (local, remote) = match kind {
			Kind::Update => (&mut self.local_update_files, &mut self.remote_update_files),
			Kind::Profile => (&mut self.local_profile_files, &mut self.remote_profile_files),
			Kind::Image => (&mut self.local_image_files, &mut self.remote_image_files),
		};
		if client == machine_name {
			local.insert(timestamp, name.to_string());
			return;
		}
		let newer = remote.get(&client).map_or(true, |f| f.timestamp < timestamp);
		if newer {
			remote.insert(client, ClientFile { name: name.to_string(), timestamp });
		}
	}

	pub fn has_chunk(&self, checksum: &str) -> bool {
		self.chunks.contains(checksum)
	}

	pub fn chunk_count(&self) -> usize {
		self.chunks.len()
	}

	/// Names that did not follow the naming scheme
	pub fn skipped(&self) -> usize {
		self.skipped
	}

	/// Newest repository descriptor as (timestamp, name)
	pub fn newest_repository(&self) -> Option<(i64, &str)> {
		self.repository_files.iter().next_back().map(|(ts, name)| (*ts, name.as_str()))
	}

	pub fn repository_files(&self) -> &BTreeMap<i64, String> {
		&self.repository_files
	}

	pub fn local_update_files(&self) -> &BTreeMap<i64, String> {
		&self.local_update_files
	}

	pub fn local_profile_files(&self) -> &BTreeMap<i64, String> {
		&self.local_profile_files
	}

	pub fn local_image_files(&self) -> &BTreeMap<i64, String> {
		&self.local_image_files
	}

	/// Newest update file of every other client
	pub fn remote_update_files(&self) -> &BTreeMap<String, ClientFile> {
		&self.remote_update_files
	}

	pub fn remote_profile_files(&self) -> &BTreeMap<String, ClientFile> {
		&self.remote_profile_files
	}

	pub fn remote_image_files(&self) -> &BTreeMap<String, ClientFile> {
		&self.remote_image_files
	}
}

#[derive(Clone, Copy)]
enum Kind {
	Update,
	Profile,
	Image,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn listing(names: &[&str]) -> BTreeMap<String, RemoteFile> {
		names.iter().map(|n| (n.to_string(), RemoteFile { name: n.to_string(), size: 0 })).collect()
	}

	#[test]
	fn test_parse_names() {
		assert_eq!(RemoteName::parse("chunk-00ff"), Some(RemoteName::Chunk { checksum: "00ff".to_string() }));
		assert_eq!(
			RemoteName::parse("update-alpha-1700000000000"),
			Some(RemoteName::Update { client: "alpha".to_string(), timestamp: 1_700_000_000_000 })
		);
		assert_eq!(RemoteName::parse("repository-12"), Some(RemoteName::Repository { timestamp: 12 }));
		assert_eq!(
			RemoteName::parse("file-abc-5"),
			Some(RemoteName::LegacyFile { checksum: "abc".to_string(), timestamp: 5 })
		);
		assert_eq!(RemoteName::parse("update-with-dash-5"), None);
		assert_eq!(RemoteName::parse("chunk-XYZ"), None);
		assert_eq!(RemoteName::parse("notes.txt"), None);
	}

	#[test]
	fn test_format_parses_back() {
		for name in &[RemoteName::update("beta", 7), RemoteName::profile("beta", 8), RemoteName::repository(9)] {
			assert_eq!(RemoteName::parse(name).map(|n| n.to_string()).as_deref(), Some(name.as_str()));
		}
	}

	#[test]
	fn test_structured_list() {
		let list = StructuredFileList::new(
			"alpha",
			&listing(&[
				"chunk-aa",
				"chunk-bb",
				"repository-1",
				"repository-3",
				"update-alpha-10",
				"update-alpha-20",
				"update-beta-5",
				"update-beta-15",
				"profile-gamma-2",
				"image-beta-4",
				"junk",
			]),
		);

		assert!(list.has_chunk("aa"));
		assert!(!list.has_chunk("cc"));
		assert_eq!(list.chunk_count(), 2);
		assert_eq!(list.newest_repository(), Some((3, "repository-3")));
		assert_eq!(list.local_update_files().len(), 2);
		assert_eq!(list.remote_update_files()["beta"].name, "update-beta-15");
		assert_eq!(list.remote_profile_files()["gamma"].timestamp, 2);
		assert_eq!(list.remote_image_files()["beta"].name, "image-beta-4");
		assert_eq!(list.skipped(), 1);
	}
}

// vim: ts=4
