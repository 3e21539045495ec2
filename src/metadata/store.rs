//! Metadata store contract

use super::{ChunkRecord, Client, FileKey, FileVersion, SyncStatus};
use crate::error::StoreResult;

/// Durable, versioned file metadata shared by every worker.
///
/// Queries that talk about "live" versions only consider the latest version
/// of each file and skip it when it is DELETED or MERGED.
pub trait MetadataStore: Send + Sync {
	// === Versions ===

	fn get_version(&self, key: FileKey) -> StoreResult<Option<FileVersion>>;

	/// Latest version of a file regardless of status
	fn get_latest(&self, file_id: u64) -> StoreResult<Option<FileVersion>>;

	/// All versions of a file ordered by version
	fn get_versions(&self, file_id: u64) -> StoreResult<Vec<FileVersion>>;

	/// Live version at `(root, path, name)`; `folder` restricts the kind when set
	fn find_by_path(
		&self,
		root_id: &str,
		path: &str,
		name: &str,
		folder: Option<bool>,
	) -> StoreResult<Option<FileVersion>>;

	/// Live versions directly inside a folder
	fn get_children(&self, folder: &FileVersion) -> StoreResult<Vec<FileVersion>>;

	/// Live versions anywhere below a folder, parents before children
	fn get_all_children(&self, folder: &FileVersion) -> StoreResult<Vec<FileVersion>>;

	/// Every live version of a root
	fn get_files(&self, root_id: &str) -> StoreResult<Vec<FileVersion>>;

	/// Live versions in a root whose whole-file checksum matches
	fn find_by_checksum(&self, root_id: &str, checksum: &str) -> StoreResult<Vec<FileVersion>>;

	/// Every stored version of the given roots, ordered by (file id, version)
	fn get_history(&self, root_ids: &[String]) -> StoreResult<Vec<FileVersion>>;

	/// Number of versions stored across all roots
	fn version_count(&self) -> StoreResult<u64>;

	/// Append one version to its file's history
	fn save_version(&self, version: &FileVersion) -> StoreResult<()> {
		self.save_versions(std::slice::from_ref(version))
	}

	/// Append several versions in a single transaction.
	///
	/// Histories are append-only: when any key, or a later version of the same
	/// file, is already stored the whole batch fails with
	/// [`StoreError::VersionExists`](crate::error::StoreError::VersionExists)
	/// and nothing is written. Callers that derived a version from a read
	/// re-read and retry.
	fn save_versions(&self, versions: &[FileVersion]) -> StoreResult<()>;

	/// Atomically drop versions `from_version..` of a file and save `replacement`.
	///
	/// Used when a local history loses a conflict and is re-homed under a new file id.
	fn rewrite_chain(&self, file_id: u64, from_version: u32, replacement: &[FileVersion]) -> StoreResult<()>;

	/// Update only the sync status of a stored version
	fn set_sync_status(&self, key: FileKey, status: SyncStatus) -> StoreResult<()>;

	// === Chunks ===

	fn get_chunk(&self, checksum: &str) -> StoreResult<Option<ChunkRecord>>;

	/// Fetch a chunk record, creating it when absent
	fn get_or_create_chunk(&self, checksum: &str) -> StoreResult<ChunkRecord>;

	// === Clients ===

	fn get_client(&self, name: &str) -> StoreResult<Option<Client>>;

	/// Fetch a client, creating an empty record when absent
	fn get_or_create_client(&self, name: &str) -> StoreResult<Client>;

	fn save_client(&self, client: &Client) -> StoreResult<()>;
}

// vim: ts=4
