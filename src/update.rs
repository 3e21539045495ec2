//! Update log: the wire form of file versions
//!
//! Each machine publishes its complete history as a packed CSV file with one
//! row per [`FileVersion`]. Instead of the full chunk list, rows past version
//! 1 carry a [`ChunkDelta`] against the previous version.

use std::collections::BTreeMap;
use std::fmt;

use crate::codec::PayloadCodec;
use crate::error::{StoreError, SyncError, UpdateParseError};
use crate::logging::*;
use crate::metadata::{is_valid_name, is_valid_relative_path, FileKey, FileStatus, FileVersion, SyncStatus, VersionRef};

/// CSV header, also the column order
pub const COLUMNS: [&str; 19] = [
	"rootId",
	"fileId",
	"version",
	"parentRootId",
	"parentFileId",
	"parentFileVersion",
	"mergedRootId",
	"mergedFileId",
	"mergedFileVersion",
	"updated",
	"status",
	"lastModified",
	"checksum",
	"clientName",
	"fileSize",
	"folder",
	"name",
	"path",
	"chunks",
];

// ============================================================================
// CHUNK DELTA
// ============================================================================

/// One edit of a chunk list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
	/// `i=id`: replace the chunk at index i
	Replace(usize, String),
	/// `+id`: append a chunk
	Append(String),
	/// `-n`: drop the last n chunks
	Truncate(usize),
}

/// Chunk list as carried by an update row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDelta {
	/// Complete list, used by version 1
	Full(Vec<String>),
	/// Edits against the previous version; empty means unchanged
	Changes(Vec<DeltaOp>),
}

impl ChunkDelta {
	/// Edits turning `old` into `new`
	pub fn between(old: &[String], new: &[String]) -> ChunkDelta {
		let mut ops = Vec::new();
		let common = old.len().min(new.len());
		for i in 0..common {
			if old[i] != new[i] {
				ops.push(DeltaOp::Replace(i, new[i].clone()));
			}
		}
		if new.len() > old.len() {
			for id in &new[common..] {
				ops.push(DeltaOp::Append(id.clone()));
			}
		} else if old.len() > new.len() {
			ops.push(DeltaOp::Truncate(old.len() - new.len()));
		}
		ChunkDelta::Changes(ops)
	}

	/// Rebuild the full chunk list given the previous version's list
	pub fn apply(&self, previous: Option<&[String]>) -> Result<Vec<String>, String> {
		match self {
			ChunkDelta::Full(ids) => Ok(ids.clone()),
			ChunkDelta::Changes(ops) => {
				let mut chunks = match previous {
					Some(p) => p.to_vec(),
					None if ops.is_empty() => Vec::new(),
					None => return Err("chunk delta without a previous version".to_string()),
				};
				for op in ops {
					match op {
						DeltaOp::Replace(i, id) => match chunks.get_mut(*i) {
							Some(slot) => *slot = id.clone(),
							None => return Err(format!("replace index {} beyond {} chunks", i, chunks.len())),
						},
						DeltaOp::Append(id) => chunks.push(id.clone()),
						DeltaOp::Truncate(n) => {
							if *n > chunks.len() {
								return Err(format!("cannot drop {} of {} chunks", n, chunks.len()));
							}
							let keep = chunks.len() - n;
							chunks.truncate(keep);
						}
					}
				}
				Ok(chunks)
			}
		}
	}

	/// Parse the `chunks` column; `full` selects the version 1 grammar
	pub fn parse(field: &str, full: bool) -> Result<ChunkDelta, String> {
		let tokens = field.split(',').map(str::trim).filter(|t| !t.is_empty());
		if full {
			return Ok(ChunkDelta::Full(tokens.map(str::to_string).collect()));
		}

		let mut ops = Vec::new();
		for token in tokens {
			let op = if let Some(id) = token.strip_prefix('+') {
				DeltaOp::Append(id.to_string())
			} else if let Some(count) = token.strip_prefix('-') {
				DeltaOp::Truncate(count.parse().map_err(|_| format!("bad truncate token '{}'", token))?)
			} else if let Some((index, id)) = token.split_once('=') {
				let index = index.parse().map_err(|_| format!("bad replace token '{}'", token))?;
				DeltaOp::Replace(index, id.to_string())
			} else {
				return Err(format!("unknown chunk token '{}'", token));
			};
			ops.push(op);
		}
		Ok(ChunkDelta::Changes(ops))
	}
}

impl fmt::Display for ChunkDelta {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let tokens: Vec<String> = match self {
			ChunkDelta::Full(ids) => ids.clone(),
			ChunkDelta::Changes(ops) => ops
				.iter()
				.map(|op| match op {
					DeltaOp::Replace(i, id) => format!("{}={}", i, id),
					DeltaOp::Append(id) => format!("+{}", id),
					DeltaOp::Truncate(n) => format!("-{}", n),
				})
				.collect(),
		};
		write!(f, "{}", tokens.join(","))
	}
}

// ============================================================================
// UPDATE
// ============================================================================

/// One row of an update log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
	pub root_id: String,
	pub file_id: u64,
	pub version: u32,
	pub parent: Option<VersionRef>,
	pub merged_to: Option<VersionRef>,
	pub updated: i64,
	pub status: FileStatus,
	pub last_modified: i64,
	pub checksum: String,
	pub client_name: String,
	pub size: u64,
	pub folder: bool,
	pub name: String,
	pub path: String,
	pub delta: ChunkDelta,
}

impl Update {
	/// Wire form of `version`; `previous` is the version before it, if any
	pub fn from_version(version: &FileVersion, previous: Option<&FileVersion>) -> Update {
		let delta = match (version.version, version.status, previous) {
			(1, _, _) | (_, _, None) => ChunkDelta::Full(version.chunks.clone()),
			(_, FileStatus::Renamed, Some(_)) | (_, FileStatus::Deleted, Some(_)) => {
				ChunkDelta::Changes(Vec::new())
			}
			(_, _, Some(prev)) => ChunkDelta::between(&prev.chunks, &version.chunks),
		};

		Update {
			root_id: version.root_id.clone(),
			file_id: version.file_id,
			version: version.version,
			parent: version.parent.clone(),
			merged_to: version.merged_to.clone(),
			updated: version.updated,
			status: version.status,
			last_modified: version.last_modified,
			checksum: version.checksum.clone(),
			client_name: version.client_name.clone(),
			size: version.size,
			folder: version.folder,
			name: version.name.clone(),
			path: version.path.clone(),
			delta,
		}
	}

	pub fn key(&self) -> FileKey {
		FileKey::new(self.file_id, self.version)
	}

	/// Key of the version this one builds on
	pub fn previous_key(&self) -> Option<FileKey> {
		self.key().previous()
	}

	pub fn is_live(&self) -> bool {
		!matches!(self.status, FileStatus::Deleted | FileStatus::Merged)
	}

	/// Whether path and name stay below the root
	pub fn has_valid_location(&self) -> bool {
		is_valid_name(&self.name) && is_valid_relative_path(&self.path)
	}

	/// Materialize the full version. `previous` must be given for version > 1.
	pub fn to_file_version(&self, previous: Option<&FileVersion>) -> Result<FileVersion, SyncError> {
		if self.version > 1 && previous.is_none() {
			if let ChunkDelta::Changes(_) = self.delta {
				return Err(StoreError::NotFound { file_id: self.file_id, version: self.version - 1 }.into());
			}
		}

		let chunks = match (self.status, previous) {
			(FileStatus::Renamed, Some(p)) | (FileStatus::Deleted, Some(p)) => p.chunks.clone(),
			_ => self.delta.apply(previous.map(|p| p.chunks.as_slice())).map_err(|message| SyncError::Other {
				message: format!("File {} v{}: {}", self.file_id, self.version, message),
			})?,
		};

		Ok(FileVersion {
			root_id: self.root_id.clone(),
			file_id: self.file_id,
			version: self.version,
			status: self.status,
			sync_status: SyncStatus::Local,
			path: self.path.clone(),
			name: self.name.clone(),
			folder: self.folder,
			size: self.size,
			last_modified: self.last_modified,
			updated: self.updated,
			checksum: self.checksum.clone(),
			chunks,
			parent: self.parent.clone(),
			merged_to: self.merged_to.clone(),
			client_name: self.client_name.clone(),
		})
	}

	fn to_record(&self) -> Vec<String> {
		let (parent_root, parent_id, parent_version) = ref_columns(&self.parent);
		let (merged_root, merged_id, merged_version) = ref_columns(&self.merged_to);
		vec![
			self.root_id.clone(),
			self.file_id.to_string(),
			self.version.to_string(),
			parent_root,
			parent_id,
			parent_version,
			merged_root,
			merged_id,
			merged_version,
			self.updated.to_string(),
			self.status.to_string(),
			self.last_modified.to_string(),
			self.checksum.clone(),
			self.client_name.clone(),
			self.size.to_string(),
			if self.folder { "1" } else { "0" }.to_string(),
			self.name.clone(),
			self.path.clone(),
			self.delta.to_string(),
		]
	}

	fn from_record(record: &csv::StringRecord, line: u64) -> Result<Update, UpdateParseError> {
		let err = |message: String| UpdateParseError { line, message };
		if record.len() != COLUMNS.len() {
			return Err(err(format!("expected {} columns, found {}", COLUMNS.len(), record.len())));
		}
		let col = |i: usize| record.get(i).unwrap_or("");

		let file_id = parse_num::<u64>(col(1), "fileId").map_err(err)?;
		let version = parse_num::<u32>(col(2), "version").map_err(err)?;
		if file_id == 0 || version == 0 {
			return Err(err("fileId and version must be positive".to_string()));
		}
		let status: FileStatus = col(10).parse().map_err(err)?;
		if version == 1 && status != FileStatus::New {
			return Err(err(format!("version 1 has status {}", status)));
		}
		let folder = match col(15) {
			"1" => true,
			"0" => false,
			other => return Err(err(format!("bad folder flag '{}'", other))),
		};

		let (name, path) = (col(16), col(17));
		if !is_valid_name(name) || !is_valid_relative_path(path) {
			return Err(err(format!("unsafe location '{}' / '{}'", path, name)));
		}

		Ok(Update {
			root_id: col(0).to_string(),
			file_id,
			version,
			parent: parse_ref(col(3), col(4), col(5)).map_err(err)?,
			merged_to: parse_ref(col(6), col(7), col(8)).map_err(err)?,
			updated: parse_num(col(9), "updated").map_err(err)?,
			status,
			last_modified: parse_num(col(11), "lastModified").map_err(err)?,
			checksum: col(12).to_string(),
			client_name: col(13).to_string(),
			size: parse_num(col(14), "fileSize").map_err(err)?,
			folder,
			name: name.to_string(),
			path: path.to_string(),
			delta: ChunkDelta::parse(col(18), version == 1).map_err(err)?,
		})
	}
}

fn ref_columns(r: &Option<VersionRef>) -> (String, String, String) {
	match r {
		Some(r) => (r.root_id.clone(), r.file_id.to_string(), r.version.to_string()),
		None => (String::new(), String::new(), String::new()),
	}
}

fn parse_ref(root: &str, file_id: &str, version: &str) -> Result<Option<VersionRef>, String> {
	if file_id.is_empty() {
		return Ok(None);
	}
	Ok(Some(VersionRef {
		root_id: root.to_string(),
		file_id: parse_num(file_id, "reference file id")?,
		version: parse_num(version, "reference version")?,
	}))
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, String> {
	s.trim().parse().map_err(|_| format!("bad {} '{}'", what, s))
}

// ============================================================================
// UPDATE FILE
// ============================================================================

/// Serialize a history into a packed update file
pub fn write_update_file(updates: &[Update], codec: &dyn PayloadCodec) -> Result<Vec<u8>, SyncError> {
	let mut writer = csv::Writer::from_writer(Vec::new());
	let csv_err = |e: csv::Error| SyncError::Other { message: format!("Cannot write update file: {}", e) };

	writer.write_record(COLUMNS.iter()).map_err(csv_err)?;
	for update in updates {
		writer.write_record(update.to_record()).map_err(csv_err)?;
	}
	let raw = writer
		.into_inner()
		.map_err(|e| SyncError::Other { message: format!("Cannot write update file: {}", e) })?;
	Ok(codec.pack(&raw))
}

/// Build the rows of an update file from a full history ordered by (file id, version)
pub fn history_to_updates(history: &[FileVersion]) -> Vec<Update> {
	let mut updates = Vec::with_capacity(history.len());
	let mut previous: Option<&FileVersion> = None;
	for version in history {
		let prev = previous.filter(|p| p.file_id == version.file_id && p.version + 1 == version.version);
		updates.push(Update::from_version(version, prev));
		previous = Some(version);
	}
	updates
}

/// Unpack and parse an update file. Malformed rows are skipped.
pub fn read_update_file(packed: &[u8], codec: &dyn PayloadCodec) -> Result<Vec<Update>, SyncError> {
	let raw = codec.unpack(packed)?;
	let mut reader = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(raw.as_slice());

	let mut updates = Vec::new();
	for (index, record) in reader.records().enumerate() {
		let line = index as u64 + 2;
		let record = match record {
			Ok(r) => r,
			Err(e) => {
				warn!("Skipping unreadable update row {}: {}", line, e);
				continue;
			}
		};
		let line = record.position().map_or(line, |p| p.line());
		match Update::from_record(&record, line) {
			Ok(update) => updates.push(update),
			Err(e) => warn!("Skipping malformed update row: {}", e),
		}
	}
	Ok(updates)
}

// ============================================================================
// UPDATE LIST
// ============================================================================

/// Merges the update files of several clients into one list.
///
/// Every client republishes the versions it has applied, so the same
/// `(file id, version)` usually shows up in several files. One client is
/// made responsible per file id: the one with the longest chain, ties going
/// to the earliest `updated` of that last version, then to the client name.
/// All versions of that file id are taken from the responsible client's
/// file; gaps in it fall back to the earliest `updated` candidate.
#[derive(Default)]
pub struct UpdateList {
	files: BTreeMap<String, Vec<Update>>,
}

impl UpdateList {
	pub fn new() -> Self {
		UpdateList::default()
	}

	pub fn add_update_file(&mut self, client_name: &str, updates: Vec<Update>) {
		debug!("Adding {} updates of client {}", updates.len(), client_name);
		self.files.insert(client_name.to_string(), updates);
	}

	pub fn is_empty(&self) -> bool {
		self.files.values().all(|u| u.is_empty())
	}

	/// Deduplicated updates ordered by (file id, version)
	pub fn generate(&self) -> Vec<Update> {
		// file id -> version -> [(client, update)]
		let mut by_file: BTreeMap<u64, BTreeMap<u32, Vec<(&str, &Update)>>> = BTreeMap::new();
		for (client, updates) in &self.files {
			for update in updates {
				by_file
					.entry(update.file_id)
					.or_default()
					.entry(update.version)
					.or_default()
					.push((client.as_str(), update));
			}
		}

		let mut result = Vec::new();
		for (file_id, versions) in by_file {
			let responsible = self.responsible_client(file_id);
			for (_, candidates) in versions {
				let chosen = candidates
					.iter()
					.find(|(client, _)| Some(*client) == responsible)
					.or_else(|| earliest(&candidates));
				if let Some((_, update)) = chosen {
					result.push((*update).clone());
				}
			}
		}
		result
	}

	fn responsible_client(&self, file_id: u64) -> Option<&str> {
		let mut best: Option<(&str, &Update)> = None;
		for (client, updates) in &self.files {
			let last = updates.iter().filter(|u| u.file_id == file_id).max_by_key(|u| u.version);
			if let Some(last) = last {
				let better = match best {
					None => true,
					Some((best_client, best_update)) => {
						(last.version, -last.updated, std::cmp::Reverse(client.as_str()))
							> (best_update.version, -best_update.updated, std::cmp::Reverse(best_client))
					}
				};
				if better {
					best = Some((client.as_str(), last));
				}
			}
		}
		best.map(|(client, _)| client)
	}
}

fn earliest<'a>(candidates: &'a [(&'a str, &'a Update)]) -> Option<&'a (&'a str, &'a Update)> {
	candidates.iter().min_by(|a, b| a.1.updated.cmp(&b.1.updated).then_with(|| a.0.cmp(b.0)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::{Lz4Codec, PlainCodec};

	fn ids(list: &[&str]) -> Vec<String> {
		list.iter().map(|s| s.to_string()).collect()
	}

	fn file_history() -> Vec<FileVersion> {
		let mut v1 = FileVersion::new_file("docs", "", "a.txt", false, "alpha");
		v1.chunks = ids(&["c1", "c2", "c3"]);
		v1.checksum = "f1".to_string();
		v1.size = 30;
		v1.parent = Some(VersionRef { root_id: "docs".to_string(), file_id: 77, version: 2 });

		let mut v2 = v1.next_version(FileStatus::Changed, "alpha");
		v2.chunks = ids(&["c1", "x2", "c3", "c4", "c5"]);
		v2.checksum = "f2".to_string();

		let mut v3 = v2.next_version(FileStatus::Renamed, "beta");
		v3.name = "b, \"quoted\".txt".to_string();

		let mut v4 = v3.next_version(FileStatus::Changed, "beta");
		v4.chunks = ids(&["c1", "x2"]);
		v4.checksum = "f4".to_string();

		let mut v5 = v4.next_version(FileStatus::Merged, "beta");
		v5.merged_to = Some(VersionRef { root_id: "docs".to_string(), file_id: 99, version: 1 });

		vec![v1, v2, v3, v4, v5]
	}

	#[test]
	fn test_delta_between() {
		let old = ids(&["a", "b", "c"]);
		assert_eq!(
			ChunkDelta::between(&old, &ids(&["a", "x", "c", "d"])),
			ChunkDelta::Changes(vec![DeltaOp::Replace(1, "x".to_string()), DeltaOp::Append("d".to_string())])
		);
		assert_eq!(ChunkDelta::between(&old, &ids(&["a"])), ChunkDelta::Changes(vec![DeltaOp::Truncate(2)]));
		assert_eq!(ChunkDelta::between(&old, &old), ChunkDelta::Changes(vec![]));
	}

	#[test]
	fn test_truncate_drops_exactly_n() {
		let delta = ChunkDelta::parse("-1", false).unwrap();
		assert_eq!(delta.apply(Some(&ids(&["a", "b", "c"]))).unwrap(), ids(&["a", "b"]));
		assert!(ChunkDelta::parse("-4", false).unwrap().apply(Some(&ids(&["a"]))).is_err());
	}

	#[test]
	fn test_delta_grammar() {
		let delta = ChunkDelta::parse("0=z,+y,-1", false).unwrap();
		assert_eq!(delta.to_string(), "0=z,+y,-1");
		assert_eq!(delta.apply(Some(&ids(&["a", "b"]))).unwrap(), ids(&["z", "b"]));

		assert_eq!(ChunkDelta::parse("a,b", true).unwrap(), ChunkDelta::Full(ids(&["a", "b"])));
		assert!(ChunkDelta::parse("?", false).is_err());
		assert!(ChunkDelta::parse("x=y", false).is_err());
	}

	#[test]
	fn test_history_roundtrip_through_file() {
		let history = file_history();
		let packed = write_update_file(&history_to_updates(&history), &Lz4Codec).unwrap();
		let updates = read_update_file(&packed, &Lz4Codec).unwrap();
		assert_eq!(updates.len(), history.len());

		let mut previous: Option<FileVersion> = None;
		for (update, original) in updates.iter().zip(&history) {
			let rebuilt = update.to_file_version(previous.as_ref()).unwrap();
			assert_eq!(rebuilt.chunks, original.chunks);
			assert_eq!(rebuilt.name, original.name);
			assert_eq!(rebuilt.parent, original.parent);
			assert_eq!(rebuilt.merged_to, original.merged_to);
			assert_eq!(rebuilt.status, original.status);
			previous = Some(rebuilt);
		}
	}

	#[test]
	fn test_renamed_rows_have_empty_delta() {
		let updates = history_to_updates(&file_history());
		assert_eq!(updates[2].status, FileStatus::Renamed);
		assert_eq!(updates[2].delta.to_string(), "");
	}

	#[test]
	fn test_malformed_rows_are_skipped() {
		let history = file_history();
		let packed = write_update_file(&history_to_updates(&history[..1]), &PlainCodec).unwrap();
		let mut text = String::from_utf8(packed).unwrap();
		text.push_str("docs,notanumber,1,,,,,,,0,NEW,0,,alpha,0,0,x,,\n");
		text.push_str("too,few,columns\n");
		text.push_str("docs,5,1,,,,,,,0,NEW,0,,alpha,0,0,escaped.txt,../..,\n");
		text.push_str("docs,6,1,,,,,,,0,NEW,0,,alpha,0,0,a/b.txt,,\n");
		text.push_str("docs,7,1,,,,,,,0,NEW,0,,alpha,0,0,..,,\n");

		let updates = read_update_file(text.as_bytes(), &PlainCodec).unwrap();
		assert_eq!(updates.len(), 1);
		assert_eq!(updates[0].file_id, history[0].file_id);
	}

	#[test]
	fn test_missing_previous_version() {
		let history = file_history();
		let updates = history_to_updates(&history);
		assert!(updates[1].to_file_version(None).is_err());
	}

	fn row(file_id: u64, version: u32, updated: i64, client: &str) -> Update {
		let mut v = FileVersion::new_file("docs", "", "f", false, client);
		v.file_id = file_id;
		v.version = version;
		v.updated = updated;
		if version > 1 {
			v.status = FileStatus::Changed;
		}
		Update::from_version(&v, None)
	}

	#[test]
	fn test_update_list_prefers_longest_chain() {
		let mut list = UpdateList::new();
		list.add_update_file("alpha", vec![row(1, 1, 100, "alpha")]);
		list.add_update_file("beta", vec![row(1, 1, 100, "alpha"), row(1, 2, 200, "beta")]);

		let result = list.generate();
		assert_eq!(result.len(), 2);
		assert_eq!(result[0].key(), FileKey::new(1, 1));
		assert_eq!(result[1].key(), FileKey::new(1, 2));
	}

	#[test]
	fn test_update_list_earliest_wins_on_equal_chains() {
		let mut list = UpdateList::new();
		list.add_update_file("alpha", vec![row(5, 1, 300, "alpha")]);
		list.add_update_file("beta", vec![row(5, 1, 200, "beta")]);
		list.add_update_file("gamma", vec![row(6, 1, 50, "gamma")]);

		let result = list.generate();
		assert_eq!(result.len(), 2);
		assert_eq!(result[0].client_name, "beta");
		assert_eq!(result[1].client_name, "gamma");
	}
}

// vim: ts=4
