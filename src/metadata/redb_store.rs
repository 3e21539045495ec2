//! Metadata store backed by redb
//!
//! Values are json5-encoded. Besides the primary version table the store
//! keeps explicit indices of the latest live version of every file by
//! location and by whole-file checksum, updated in the same write
//! transaction as the versions themselves.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

use super::store::MetadataStore;
use super::{now_millis, ChunkRecord, Client, FileKey, FileVersion, SyncStatus};
use crate::error::{StoreError, StoreResult};
use crate::logging::*;

/// Key: (file id, version)
/// Value: serialized FileVersion
const VERSIONS_TABLE: TableDefinition<(u64, u32), &[u8]> = TableDefinition::new("versions");

/// Key: root \0 path \0 name
/// Value: serialized list of file ids whose latest version is live there
const LOCATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("locations");

/// Key: root \0 checksum
/// Value: serialized list of file ids whose latest live version has that checksum
const CHECKSUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checksums");

/// Key: chunk checksum
/// Value: serialized ChunkRecord
const CHUNKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");

/// Key: client machine name
/// Value: serialized Client
const CLIENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("clients");

const CHUNK_RETRIES: usize = 5;
const CLIENT_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

type IndexTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
	Ok(json5::to_string(value)?.into_bytes())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
	Ok(json5::from_str(std::str::from_utf8(bytes)?)?)
}

fn location_key(root_id: &str, path: &str, name: &str) -> String {
	format!("{}\0{}\0{}", root_id, path, name)
}

fn checksum_key(root_id: &str, checksum: &str) -> String {
	format!("{}\0{}", root_id, checksum)
}

fn read_ids<T>(table: &T, key: &str) -> StoreResult<Vec<u64>>
where
	T: ReadableTable<&'static str, &'static [u8]>,
{
	match table.get(key)? {
		Some(entry) => decode(entry.value()),
		None => Ok(Vec::new()),
	}
}

/// Ids stored under every key starting with `prefix`
fn scan_ids<T>(table: &T, prefix: &str) -> StoreResult<Vec<u64>>
where
	T: ReadableTable<&'static str, &'static [u8]>,
{
	let mut ids = Vec::new();
	for entry in table.range(prefix..)? {
		let (key, value) = entry?;
		if !key.value().starts_with(prefix) {
			break;
		}
		let mut found: Vec<u64> = decode(value.value())?;
		ids.append(&mut found);
	}
	Ok(ids)
}

fn index_add(table: &mut IndexTable<'_>, key: &str, file_id: u64) -> StoreResult<()> {
	let mut ids = read_ids(&*table, key)?;
	if !ids.contains(&file_id) {
		ids.push(file_id);
		table.insert(key, encode(&ids)?.as_slice())?;
	}
	Ok(())
}

fn index_remove(table: &mut IndexTable<'_>, key: &str, file_id: u64) -> StoreResult<()> {
	let mut ids = read_ids(&*table, key)?;
	let before = ids.len();
	ids.retain(|id| *id != file_id);
	if ids.is_empty() {
		table.remove(key)?;
	} else if ids.len() != before {
		table.insert(key, encode(&ids)?.as_slice())?;
	}
	Ok(())
}

type VersionTable<'txn> = redb::Table<'txn, (u64, u32), &'static [u8]>;

fn index(locations: &mut IndexTable<'_>, checksums: &mut IndexTable<'_>, version: &FileVersion) -> StoreResult<()> {
	// Shadowed versions are history only; another file owns their location
	if !version.is_live() || version.sync_status == SyncStatus::Conflict {
		return Ok(());
	}
	index_add(locations, &location_key(&version.root_id, &version.path, &version.name), version.file_id)?;
	if !version.checksum.is_empty() {
		index_add(checksums, &checksum_key(&version.root_id, &version.checksum), version.file_id)?;
	}
	Ok(())
}

fn unindex(locations: &mut IndexTable<'_>, checksums: &mut IndexTable<'_>, version: &FileVersion) -> StoreResult<()> {
	index_remove(locations, &location_key(&version.root_id, &version.path, &version.name), version.file_id)?;
	if !version.checksum.is_empty() {
		index_remove(checksums, &checksum_key(&version.root_id, &version.checksum), version.file_id)?;
	}
	Ok(())
}

/// Append a version as the newest of its file and move the file's index entries.
///
/// Fails when the key, or a later version of the file, is already stored.
fn save_in(
	table: &mut VersionTable<'_>,
	locations: &mut IndexTable<'_>,
	checksums: &mut IndexTable<'_>,
	version: &FileVersion,
) -> StoreResult<()> {
	let previous = latest_in(&*table, version.file_id)?;
	if previous.as_ref().map_or(false, |p| p.version >= version.version) {
		return Err(StoreError::VersionExists { file_id: version.file_id, version: version.version });
	}
	table.insert((version.file_id, version.version), encode(version)?.as_slice())?;

	if let Some(prev) = previous {
		unindex(locations, checksums, &prev)?;
	}
	index(locations, checksums, version)
}

fn latest_in<T>(table: &T, file_id: u64) -> StoreResult<Option<FileVersion>>
where
	T: ReadableTable<(u64, u32), &'static [u8]>,
{
	match table.range((file_id, 0u32)..=(file_id, u32::MAX))?.next_back() {
		Some(entry) => {
			let (_, value) = entry?;
			Ok(Some(decode(value.value())?))
		}
		None => Ok(None),
	}
}

fn retry<T, F>(what: &str, attempts: usize, mut op: F) -> StoreResult<T>
where
	F: FnMut() -> StoreResult<T>,
{
	let mut last = None;
	for attempt in 0..attempts {
		match op() {
			Ok(value) => return Ok(value),
			Err(StoreError::Database { source }) => {
				debug!("Creating {} failed (attempt {}): {}", what, attempt + 1, source);
				last = Some(source);
				thread::sleep(RETRY_DELAY);
			}
			Err(e) => return Err(e),
		}
	}
	match last {
		Some(source) => {
			warn!("Giving up creating {}: {}", what, source);
			Err(StoreError::Contention { what: what.to_string() })
		}
		None => Err(StoreError::Contention { what: what.to_string() }),
	}
}

/// Metadata store backed by a single redb database file
pub struct RedbStore {
	db: redb::Database,
}

impl RedbStore {
	/// Open or create the database
	pub fn open(db_path: &Path) -> StoreResult<Self> {
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(VERSIONS_TABLE)?;
			let _ = write_txn.open_table(LOCATIONS_TABLE)?;
			let _ = write_txn.open_table(CHECKSUMS_TABLE)?;
			let _ = write_txn.open_table(CHUNKS_TABLE)?;
			let _ = write_txn.open_table(CLIENTS_TABLE)?;
			write_txn.commit()?;
		}
		Ok(RedbStore { db })
	}

	fn load_latest_live(&self, ids: Vec<u64>) -> StoreResult<Vec<FileVersion>> {
		let read_txn = self.db.begin_read()?;
		let versions = read_txn.open_table(VERSIONS_TABLE)?;
		let mut seen = HashSet::new();
		let mut result = Vec::new();
		for id in ids {
			if !seen.insert(id) {
				continue;
			}
			if let Some(v) = latest_in(&versions, id)? {
				if v.is_live() {
					result.push(v);
				}
			}
		}
		Ok(result)
	}

	fn scan_locations(&self, prefix: &str) -> StoreResult<Vec<u64>> {
		let read_txn = self.db.begin_read()?;
		let locations = read_txn.open_table(LOCATIONS_TABLE)?;
		scan_ids(&locations, prefix)
	}
}

impl MetadataStore for RedbStore {
	fn get_version(&self, key: FileKey) -> StoreResult<Option<FileVersion>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(VERSIONS_TABLE)?;
		match table.get((key.file_id, key.version))? {
			Some(entry) => Ok(Some(decode(entry.value())?)),
			None => Ok(None),
		}
	}

	fn get_latest(&self, file_id: u64) -> StoreResult<Option<FileVersion>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(VERSIONS_TABLE)?;
		latest_in(&table, file_id)
	}

	fn get_versions(&self, file_id: u64) -> StoreResult<Vec<FileVersion>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(VERSIONS_TABLE)?;
		let mut result = Vec::new();
		for entry in table.range((file_id, 0u32)..=(file_id, u32::MAX))? {
			let (_, value) = entry?;
			result.push(decode(value.value())?);
		}
		Ok(result)
	}

	fn find_by_path(
		&self,
		root_id: &str,
		path: &str,
		name: &str,
		folder: Option<bool>,
	) -> StoreResult<Option<FileVersion>> {
		let ids = {
			let read_txn = self.db.begin_read()?;
			let locations = read_txn.open_table(LOCATIONS_TABLE)?;
			read_ids(&locations, &location_key(root_id, path, name))?
		};
		Ok(self
			.load_latest_live(ids)?
			.into_iter()
			.find(|v| folder.map_or(true, |f| v.folder == f)))
	}

	fn get_children(&self, folder: &FileVersion) -> StoreResult<Vec<FileVersion>> {
		let prefix = format!("{}\0{}\0", folder.root_id, folder.relative_path());
		let ids = self.scan_locations(&prefix)?;
		self.load_latest_live(ids)
	}

	fn get_all_children(&self, folder: &FileVersion) -> StoreResult<Vec<FileVersion>> {
		let full = folder.relative_path();
		let mut ids = self.scan_locations(&format!("{}\0{}\0", folder.root_id, full))?;
		ids.append(&mut self.scan_locations(&format!("{}\0{}/", folder.root_id, full))?);

		let mut children = self.load_latest_live(ids)?;
		children.sort_by(|a, b| {
			let depth_a = a.path.matches('/').count();
			let depth_b = b.path.matches('/').count();
			depth_a.cmp(&depth_b).then_with(|| a.relative_path().cmp(&b.relative_path()))
		});
		Ok(children)
	}

	fn get_files(&self, root_id: &str) -> StoreResult<Vec<FileVersion>> {
		let ids = self.scan_locations(&format!("{}\0", root_id))?;
		self.load_latest_live(ids)
	}

	fn find_by_checksum(&self, root_id: &str, checksum: &str) -> StoreResult<Vec<FileVersion>> {
		let ids = {
			let read_txn = self.db.begin_read()?;
			let checksums = read_txn.open_table(CHECKSUMS_TABLE)?;
			read_ids(&checksums, &checksum_key(root_id, checksum))?
		};
		self.load_latest_live(ids)
	}

	fn get_history(&self, root_ids: &[String]) -> StoreResult<Vec<FileVersion>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(VERSIONS_TABLE)?;
		let mut result = Vec::new();
		for entry in table.iter()? {
			let (_, value) = entry?;
			let version: FileVersion = decode(value.value())?;
			if root_ids.iter().any(|r| *r == version.root_id) {
				result.push(version);
			}
		}
		Ok(result)
	}

	fn version_count(&self) -> StoreResult<u64> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(VERSIONS_TABLE)?;
		let mut count = 0;
		for entry in table.iter()? {
			entry?;
			count += 1;
		}
		Ok(count)
	}

	fn save_versions(&self, versions: &[FileVersion]) -> StoreResult<()> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(VERSIONS_TABLE)?;
			let mut locations = write_txn.open_table(LOCATIONS_TABLE)?;
			let mut checksums = write_txn.open_table(CHECKSUMS_TABLE)?;
			for version in versions {
				save_in(&mut table, &mut locations, &mut checksums, version)?;
			}
		}
		write_txn.commit()?;
		Ok(())
	}

	fn rewrite_chain(&self, file_id: u64, from_version: u32, replacement: &[FileVersion]) -> StoreResult<()> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(VERSIONS_TABLE)?;
			let mut locations = write_txn.open_table(LOCATIONS_TABLE)?;
			let mut checksums = write_txn.open_table(CHECKSUMS_TABLE)?;

			if let Some(latest) = latest_in(&table, file_id)? {
				unindex(&mut locations, &mut checksums, &latest)?;
			}
			let doomed: Vec<(u64, u32)> = {
				let mut keys = Vec::new();
				for entry in table.range((file_id, from_version)..=(file_id, u32::MAX))? {
					let (key, _) = entry?;
					keys.push(key.value());
				}
				keys
			};
			for key in doomed {
				table.remove(key)?;
			}
			if let Some(remaining) = latest_in(&table, file_id)? {
				index(&mut locations, &mut checksums, &remaining)?;
			}

			for version in replacement {
				save_in(&mut table, &mut locations, &mut checksums, version)?;
			}
		}
		write_txn.commit()?;
		Ok(())
	}

	fn set_sync_status(&self, key: FileKey, status: SyncStatus) -> StoreResult<()> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(VERSIONS_TABLE)?;
			let mut version: FileVersion = match table.get((key.file_id, key.version))? {
				Some(entry) => decode(entry.value())?,
				None => return Err(StoreError::NotFound { file_id: key.file_id, version: key.version }),
			};
			if version.sync_status == status {
				return Ok(());
			}
			version.sync_status = status;
			table.insert((key.file_id, key.version), encode(&version)?.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	fn get_chunk(&self, checksum: &str) -> StoreResult<Option<ChunkRecord>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(CHUNKS_TABLE)?;
		match table.get(checksum)? {
			Some(entry) => Ok(Some(decode(entry.value())?)),
			None => Ok(None),
		}
	}

	fn get_or_create_chunk(&self, checksum: &str) -> StoreResult<ChunkRecord> {
		retry(&format!("chunk {}", checksum), CHUNK_RETRIES, || {
			let write_txn = self.db.begin_write()?;
			let record = {
				let mut table = write_txn.open_table(CHUNKS_TABLE)?;
				let existing: Option<ChunkRecord> = match table.get(checksum)? {
					Some(entry) => Some(decode(entry.value())?),
					None => None,
				};
				match existing {
					Some(record) => record,
					None => {
						let record = ChunkRecord { checksum: checksum.to_string(), created: now_millis() };
						table.insert(checksum, encode(&record)?.as_slice())?;
						record
					}
				}
			};
			write_txn.commit()?;
			Ok(record)
		})
	}

	fn get_client(&self, name: &str) -> StoreResult<Option<Client>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(CLIENTS_TABLE)?;
		match table.get(name)? {
			Some(entry) => Ok(Some(decode(entry.value())?)),
			None => Ok(None),
		}
	}

	fn get_or_create_client(&self, name: &str) -> StoreResult<Client> {
		retry(&format!("client {}", name), CLIENT_RETRIES, || {
			let write_txn = self.db.begin_write()?;
			let client = {
				let mut table = write_txn.open_table(CLIENTS_TABLE)?;
				let existing: Option<Client> = match table.get(name)? {
					Some(entry) => Some(decode(entry.value())?),
					None => None,
				};
				match existing {
					Some(client) => client,
					None => {
						let client = Client::new(name);
						table.insert(name, encode(&client)?.as_slice())?;
						client
					}
				}
			};
			write_txn.commit()?;
			Ok(client)
		})
	}

	fn save_client(&self, client: &Client) -> StoreResult<()> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(CLIENTS_TABLE)?;
			table.insert(client.name.as_str(), encode(client)?.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}
}


// vim: ts=4
