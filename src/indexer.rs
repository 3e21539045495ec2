//! Local change indexer
//!
//! Turns "something happened at this path" into new file versions. Every
//! request goes through a single worker, so the store never sees two index
//! operations interleave. Full-tree scans at startup and on a timer use the
//! same per-path logic.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::{Context, Profile, Root};
use crate::error::SyncError;
use crate::logging::*;
use crate::metadata::{join_relative, split_relative, FileStatus, FileVersion, VersionRef};
use crate::uploader::UploadQueue;
use crate::util::{self, is_ignored_name, is_ignored_path, levenshtein, mtime_millis, relative_to};

/// Largest path edit distance at which a vanished file with the same checksum counts as renamed
pub const MAX_RENAME_DISTANCE: usize = 10;

/// Modification times closer than this are considered equal
const MTIME_TOLERANCE_MS: i64 = 500;

// ============================================================================
// REQUESTS AND THE WATCH CONTRACT
// ============================================================================

/// Work item of the indexer queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRequest {
	/// Path was created or modified
	Check { root_id: String, path: PathBuf },
	/// Path vanished
	Delete { root_id: String, path: PathBuf },
	/// Path was moved within a root
	Move { root_id: String, from: PathBuf, to: PathBuf },
	/// Rescan a whole root
	Scan { root_id: String },
}

/// Callbacks of a filesystem watcher
pub trait WatchListener: Send + Sync {
	fn on_created_or_modified(&self, root_id: &str, path: &Path);

	fn on_deleted(&self, root_id: &str, path: &Path);

	fn on_renamed(&self, root_id: &str, from: &Path, to: &Path);
}

/// Sending side of the indexer queue
#[derive(Clone)]
pub struct IndexerHandle {
	tx: mpsc::UnboundedSender<IndexRequest>,
}

impl IndexerHandle {
	pub fn channel() -> (IndexerHandle, mpsc::UnboundedReceiver<IndexRequest>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(IndexerHandle { tx }, rx)
	}

	pub fn request(&self, request: IndexRequest) {
		if self.tx.send(request).is_err() {
			debug!("Indexer stopped, dropping request");
		}
	}
}

impl WatchListener for IndexerHandle {
	fn on_created_or_modified(&self, root_id: &str, path: &Path) {
		self.request(IndexRequest::Check { root_id: root_id.to_string(), path: path.to_path_buf() });
	}

	fn on_deleted(&self, root_id: &str, path: &Path) {
		self.request(IndexRequest::Delete { root_id: root_id.to_string(), path: path.to_path_buf() });
	}

	fn on_renamed(&self, root_id: &str, from: &Path, to: &Path) {
		self.request(IndexRequest::Move {
			root_id: root_id.to_string(),
			from: from.to_path_buf(),
			to: to.to_path_buf(),
		});
	}
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// What indexing one path did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
	/// Store already matches the disk
	Unchanged,
	/// Path is excluded or outside the root
	Ignored,
	/// Disk and request disagree (the path vanished or reappeared); nothing done
	Skipped,
	New(FileVersion),
	Changed(FileVersion),
	/// A vanished file with the same content was found and moved here
	Renamed(FileVersion),
	/// Versions marked deleted, including descendants
	Deleted(usize),
	/// Versions re-homed by a move, including descendants
	Moved(usize),
}

/// Counters of a full-tree scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
	pub checked: usize,
	pub changed: usize,
	pub deleted: usize,
	pub removed_ignored: usize,
}

// ============================================================================
// INDEXER
// ============================================================================

pub struct Indexer {
	ctx: Arc<Context>,
	profile: Arc<Profile>,
	uploads: UploadQueue,
}

impl Indexer {
	pub fn new(ctx: Arc<Context>, profile: Arc<Profile>, uploads: UploadQueue) -> Self {
		Indexer { ctx, profile, uploads }
	}

	/// Startup scan, then drain requests and rescan periodically until cancelled
	pub async fn run(
		self: Arc<Self>,
		mut rx: mpsc::UnboundedReceiver<IndexRequest>,
		cancel: CancellationToken,
		tree_search_interval: Duration,
	) {
		info!("Indexer for profile {} started", self.profile.name);
		for root_id in self.profile.root_ids() {
			let indexer = self.clone();
			let result = tokio::task::spawn_blocking(move || indexer.startup_index(&root_id)).await;
			if let Err(e) = result {
				error!("Startup index task failed: {}", e);
			}
		}

		let mut ticker = tokio::time::interval(tree_search_interval);
		ticker.tick().await;
		loop {
			let requests: Vec<IndexRequest> = tokio::select! {
				_ = cancel.cancelled() => break,
				_ = ticker.tick() => {
					self.profile.root_ids().into_iter().map(|root_id| IndexRequest::Scan { root_id }).collect()
				}
				r = rx.recv() => match r {
					Some(r) => vec![r],
					None => break,
				},
			};

			for request in requests {
				let indexer = self.clone();
				if let Err(e) = tokio::task::spawn_blocking(move || indexer.process(request)).await {
					error!("Index task failed: {}", e);
				}
			}
		}
		info!("Indexer for profile {} stopped", self.profile.name);
	}

	fn startup_index(&self, root_id: &str) {
		match self.profile.root(root_id) {
			Some(root) => match self.scan_root(root, true) {
				Ok(stats) => info!(
					"Indexed {}: {} checked, {} changed, {} deleted",
					root.local_path.display(),
					stats.checked,
					stats.changed,
					stats.deleted
				),
				Err(e) => error!("Indexing {} failed: {}", root.local_path.display(), e),
			},
			None => warn!("Unknown root {}", root_id),
		}
	}

	/// Handle one queued request, logging failures
	pub fn process(&self, request: IndexRequest) {
		debug!("Index request {:?}", request);
		let root_id = match &request {
			IndexRequest::Check { root_id, .. }
			| IndexRequest::Delete { root_id, .. }
			| IndexRequest::Move { root_id, .. }
			| IndexRequest::Scan { root_id } => root_id.clone(),
		};
		let root = match self.profile.root(&root_id) {
			Some(r) => r,
			None => {
				warn!("Index request for unknown root {}", root_id);
				return;
			}
		};

		let mut result = self.handle(root, &request);
		if matches!(&result, Err(e) if e.is_version_race()) {
			// The change manager wrote to the same history; index again on top of it
			debug!("Re-indexing after a concurrent store write: {:?}", request);
			result = self.handle(root, &request);
		}
		if let Err(e) = result {
			warn!("Index request {:?} failed: {}", request, e);
			self.ctx.observer.on_error(&e);
		}
	}

	fn handle(&self, root: &Root, request: &IndexRequest) -> Result<(), SyncError> {
		match request {
			IndexRequest::Check { path, .. } => self.check(root, path).map(|_| ()),
			IndexRequest::Delete { path, .. } => self.delete(root, path).map(|_| ()),
			IndexRequest::Move { from, to, .. } => self.move_path(root, from, to).map(|_| ()),
			IndexRequest::Scan { .. } => self.scan_root(root, false).map(|_| ()),
		}
	}

	// ------------------------------------------------------------------------
	// Created or modified
	// ------------------------------------------------------------------------

	/// Bring the store in line with what is on disk at `path`
	pub fn check(&self, root: &Root, path: &Path) -> Result<IndexOutcome, SyncError> {
		let relative = match relative_to(&root.local_path, path) {
			Some(r) => r,
			None => return Ok(IndexOutcome::Ignored),
		};
		if is_ignored_path(Path::new(&relative)) {
			return Ok(IndexOutcome::Ignored);
		}
		if self.ctx.busy.contains(path) {
			debug!("{} is being written by the change manager", relative);
			return Ok(IndexOutcome::Skipped);
		}
		let meta = match fs::symlink_metadata(path) {
			Ok(m) => m,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				debug!("{} vanished before indexing", relative);
				return Ok(IndexOutcome::Skipped);
			}
			Err(e) => return Err(e.into()),
		};
		if meta.file_type().is_symlink() {
			debug!("Skipping symlink {}", relative);
			return Ok(IndexOutcome::Ignored);
		}

		let folder = meta.is_dir();
		let (dir, name) = split_relative(&relative);
		let parent = self.ensure_parent(root, &dir)?;
		let store = &self.ctx.store;

		match store.find_by_path(&root.remote_id, &dir, &name, None)? {
			Some(previous) if previous.folder == folder => {
				if folder {
					return Ok(IndexOutcome::Unchanged);
				}
				let mtime = mtime_millis(&meta);
				if previous.size == meta.len() && (previous.last_modified - mtime).abs() <= MTIME_TOLERANCE_MS {
					return Ok(IndexOutcome::Unchanged);
				}
				self.index_changed(path, &previous, parent, mtime)
			}
			Some(previous) => {
				info!("{} changed between file and folder", relative);
				self.mark_deleted(&previous)?;
				self.index_new(root, path, &dir, &name, folder, parent, mtime_millis(&meta))
			}
			None => self.index_new(root, path, &dir, &name, folder, parent, mtime_millis(&meta)),
		}
	}

	/// Live version of the folder `dir`, indexing it first when it is on disk but unknown
	fn ensure_parent(&self, root: &Root, dir: &str) -> Result<Option<VersionRef>, SyncError> {
		if dir.is_empty() {
			return Ok(None);
		}
		let (parent_dir, parent_name) = split_relative(dir);
		let store = &self.ctx.store;
		if let Some(folder) = store.find_by_path(&root.remote_id, &parent_dir, &parent_name, Some(true))? {
			return Ok(Some(folder.version_ref()));
		}

		let on_disk = root.local_path.join(dir);
		self.check(root, &on_disk)?;
		Ok(store
			.find_by_path(&root.remote_id, &parent_dir, &parent_name, Some(true))?
			.map(|f| f.version_ref()))
	}

	#[allow(clippy::too_many_arguments)]
	fn index_new(
		&self,
		root: &Root,
		path: &Path,
		dir: &str,
		name: &str,
		folder: bool,
		parent: Option<VersionRef>,
		mtime: i64,
	) -> Result<IndexOutcome, SyncError> {
		let machine = &self.ctx.machine_name;
		if folder {
			let mut version = FileVersion::new_file(&root.remote_id, dir, name, true, machine);
			version.parent = parent;
			version.last_modified = mtime;
			self.persist(vec![version.clone()])?;
			debug!("New folder {}", version.relative_path());
			return Ok(IndexOutcome::New(version));
		}

		let (checksum, chunks, size) = self.chunk_file(path)?;

		if let Some(source) = self.guess_renamed_from(root, path, &checksum)? {
			let mut version = source.next_version(FileStatus::Renamed, machine);
			version.path = dir.to_string();
			version.name = name.to_string();
			version.parent = parent;
			version.last_modified = mtime;
			self.persist(vec![version.clone()])?;
			info!("{} looks like {} renamed", version.relative_path(), source.relative_path());
			return Ok(IndexOutcome::Renamed(version));
		}

		let mut version = FileVersion::new_file(&root.remote_id, dir, name, false, machine);
		version.parent = parent;
		version.last_modified = mtime;
		version.size = size;
		version.checksum = checksum;
		version.chunks = chunks;
		self.persist(vec![version.clone()])?;
		debug!("New file {} ({} chunks)", version.relative_path(), version.chunks.len());
		Ok(IndexOutcome::New(version))
	}

	fn index_changed(
		&self,
		path: &Path,
		previous: &FileVersion,
		parent: Option<VersionRef>,
		mtime: i64,
	) -> Result<IndexOutcome, SyncError> {
		let (checksum, chunks, size) = self.chunk_file(path)?;
		let mut version = previous.next_version(FileStatus::Changed, &self.ctx.machine_name);
		version.parent = parent.or_else(|| previous.parent.clone());
		version.last_modified = mtime;
		version.size = size;
		version.checksum = checksum;
		version.chunks = chunks;
		self.persist(vec![version.clone()])?;
		debug!("Changed file {} (v{})", version.relative_path(), version.version);
		Ok(IndexOutcome::Changed(version))
	}

	/// A live file with this checksum whose own path no longer exists, nearest by path
	fn guess_renamed_from(&self, root: &Root, path: &Path, checksum: &str) -> Result<Option<FileVersion>, SyncError> {
		let target = path.to_string_lossy();
		let candidates = self.ctx.store.find_by_checksum(&root.remote_id, checksum)?;
		Ok(candidates
			.into_iter()
			.filter(|c| !c.folder && !c.local_path(&root.local_path).exists())
			.map(|c| {
				let distance = levenshtein(&c.local_path(&root.local_path).to_string_lossy(), &target);
				(distance, c)
			})
			.filter(|(distance, _)| *distance <= MAX_RENAME_DISTANCE)
			.min_by_key(|(distance, _)| *distance)
			.map(|(_, c)| c))
	}

	/// Chunk a file into the cache; returns (checksum, chunk ids, size)
	fn chunk_file(&self, path: &Path) -> Result<(String, Vec<String>, u64), SyncError> {
		let mut checksum = String::new();
		let mut ids = Vec::new();
		let mut size = 0u64;

		for chunk in self.profile.chunker.chunk_file(path)? {
			let chunk = chunk?;
			if !self.ctx.cache.contains(&chunk.checksum) {
				self.ctx.cache.store(&chunk.checksum, &chunk.contents)?;
			}
			self.ctx.store.get_or_create_chunk(&chunk.checksum)?;
			size += chunk.len() as u64;
			if let Some(file_checksum) = chunk.file_checksum {
				checksum = file_checksum;
			}
			ids.push(chunk.checksum);
		}
		Ok((checksum, ids, size))
	}

	// ------------------------------------------------------------------------
	// Deleted
	// ------------------------------------------------------------------------

	/// Record that `path` vanished
	pub fn delete(&self, root: &Root, path: &Path) -> Result<IndexOutcome, SyncError> {
		let relative = match relative_to(&root.local_path, path) {
			Some(r) => r,
			None => return Ok(IndexOutcome::Ignored),
		};
		if is_ignored_path(Path::new(&relative)) {
			return Ok(IndexOutcome::Ignored);
		}
		if fs::symlink_metadata(path).is_ok() || self.ctx.busy.contains(path) {
			debug!("{} reported deleted but exists or is being written", relative);
			return Ok(IndexOutcome::Skipped);
		}

		let (dir, name) = split_relative(&relative);
		match self.ctx.store.find_by_path(&root.remote_id, &dir, &name, None)? {
			Some(version) => Ok(IndexOutcome::Deleted(self.mark_deleted(&version)?)),
			None => Ok(IndexOutcome::Skipped),
		}
	}

	/// Append DELETED versions for a file or folder and everything below it
	fn mark_deleted(&self, version: &FileVersion) -> Result<usize, SyncError> {
		let machine = &self.ctx.machine_name;
		let mut deleted = Vec::new();
		if version.folder {
			let mut children = self.ctx.store.get_all_children(version)?;
			children.reverse();
			deleted.extend(children.iter().map(|c| c.next_version(FileStatus::Deleted, machine)));
		}
		deleted.push(version.next_version(FileStatus::Deleted, machine));

		let count = deleted.len();
		info!("Deleted {} ({} versions)", version.relative_path(), count);
		self.persist(deleted)?;
		Ok(count)
	}

	// ------------------------------------------------------------------------
	// Moved
	// ------------------------------------------------------------------------

	/// Re-home a file or folder (with its descendants) from `from` to `to`
	pub fn move_path(&self, root: &Root, from: &Path, to: &Path) -> Result<IndexOutcome, SyncError> {
		let (from_rel, to_rel) = match (relative_to(&root.local_path, from), relative_to(&root.local_path, to)) {
			(Some(f), Some(t)) => (f, t),
			(Some(_), None) => return self.delete(root, from),
			(None, Some(_)) => return self.check(root, to),
			(None, None) => return Ok(IndexOutcome::Ignored),
		};
		if is_ignored_path(Path::new(&to_rel)) {
			return self.delete(root, from);
		}
		if is_ignored_path(Path::new(&from_rel)) {
			return self.check(root, to);
		}
		if self.ctx.busy.contains(from) || self.ctx.busy.contains(to) {
			debug!("Move of {} to {} is the change manager's", from_rel, to_rel);
			return Ok(IndexOutcome::Skipped);
		}
		if fs::symlink_metadata(to).is_err() {
			debug!("Move target {} vanished", to_rel);
			return self.delete(root, from);
		}

		let store = &self.ctx.store;
		let (from_dir, from_name) = split_relative(&from_rel);
		let source = match store.find_by_path(&root.remote_id, &from_dir, &from_name, None)? {
			Some(s) => s,
			None => return self.check(root, to),
		};

		let (to_dir, to_name) = split_relative(&to_rel);
		if let Some(overwritten) = store.find_by_path(&root.remote_id, &to_dir, &to_name, None)? {
			if overwritten.file_id != source.file_id {
				self.mark_deleted(&overwritten)?;
			}
		}
		let parent = self.ensure_parent(root, &to_dir)?;

		let machine = &self.ctx.machine_name;
		let mut moved = source.next_version(FileStatus::Renamed, machine);
		moved.path = to_dir;
		moved.name = to_name;
		moved.parent = parent;

		let mut versions = vec![moved.clone()];
		if source.folder {
			let old_prefix = source.relative_path();
			let new_prefix = moved.relative_path();
			let mut folders: HashMap<u64, VersionRef> = HashMap::new();
			folders.insert(source.file_id, moved.version_ref());

			for child in store.get_all_children(&source)? {
				let mut c = child.next_version(FileStatus::Renamed, machine);
				c.path = rehome(&child.path, &old_prefix, &new_prefix);
				if let Some(p) = child.parent.as_ref().and_then(|p| folders.get(&p.file_id)) {
					c.parent = Some(p.clone());
				}
				if c.folder {
					folders.insert(c.file_id, c.version_ref());
				}
				versions.push(c);
			}
		}

		let count = versions.len();
		info!("Moved {} to {} ({} versions)", from_rel, to_rel, count);
		self.persist(versions)?;

		if !source.folder {
			if let IndexOutcome::Changed(_) = self.check(root, to)? {
				debug!("{} also changed while moving", to_rel);
			}
		}
		Ok(IndexOutcome::Moved(count))
	}

	// ------------------------------------------------------------------------
	// Full-tree scans
	// ------------------------------------------------------------------------

	/// Mark vanished files deleted, then check every path under the root.
	///
	/// With `remove_ignored` set, leftover `.ignore*` entries are deleted from disk.
	pub fn scan_root(&self, root: &Root, remove_ignored: bool) -> Result<ScanStats, SyncError> {
		fs::create_dir_all(&root.local_path)?;
		let mut stats = ScanStats::default();
		let store = &self.ctx.store;

		let mut known = store.get_files(&root.remote_id)?;
		known.sort_by_key(|v| v.path.matches('/').count() + if v.path.is_empty() { 0 } else { 1 });
		for version in known {
			let path = version.local_path(&root.local_path);
			if path.exists() || self.ctx.busy.contains(&path) {
				continue;
			}
			// A folder deleted earlier in this loop already took its children with it
			let still_live = store.get_latest(version.file_id)?.map_or(false, |v| v.is_live() && v.version == version.version);
			if still_live {
				stats.deleted += self.mark_deleted(&version)?;
			}
		}

		self.walk(root, &root.local_path, remove_ignored, &mut stats)?;
		Ok(stats)
	}

	fn walk(&self, root: &Root, dir: &Path, remove_ignored: bool, stats: &mut ScanStats) -> Result<(), SyncError> {
		let mut entries: Vec<fs::DirEntry> = match fs::read_dir(dir) {
			Ok(rd) => rd.filter_map(Result::ok).collect(),
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		entries.sort_by_key(|e| e.file_name());

		for entry in entries {
			let path = entry.path();
			let ignored = entry.file_name().to_str().map_or(true, is_ignored_name);
			if ignored {
				if remove_ignored && entry.file_name().to_str().map_or(false, is_ignored_name) {
					match util::delete_recursively(&path) {
						Ok(()) => stats.removed_ignored += 1,
						Err(e) => warn!("Cannot remove {:?}: {}", path, e),
					}
				}
				continue;
			}

			stats.checked += 1;
			match self.check(root, &path) {
				Ok(IndexOutcome::New(_)) | Ok(IndexOutcome::Changed(_)) | Ok(IndexOutcome::Renamed(_)) => {
					stats.changed += 1
				}
				Ok(_) => {}
				Err(e) => warn!("Cannot index {:?}: {}", path, e),
			}

			let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
			if is_dir {
				self.walk(root, &path, remove_ignored, stats)?;
			}
		}
		Ok(())
	}

	fn persist(&self, versions: Vec<FileVersion>) -> Result<(), SyncError> {
		self.ctx.store.save_versions(&versions)?;
		for version in versions {
			self.uploads.queue(version);
		}
		Ok(())
	}
}

/// Rewrite a folder path that lies at or below `old_prefix`
fn rehome(path: &str, old_prefix: &str, new_prefix: &str) -> String {
	if path == old_prefix {
		return new_prefix.to_string();
	}
	match path.strip_prefix(old_prefix).and_then(|rest| rest.strip_prefix('/')) {
		Some(rest) => join_relative(new_prefix, rest),
		None => path.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_rehome() {
		assert_eq!(rehome("a/b", "a/b", "x"), "x");
		assert_eq!(rehome("a/b/c/d", "a/b", "x/y"), "x/y/c/d");
		assert_eq!(rehome("a/bc", "a/b", "x"), "a/bc");
	}
}

// vim: ts=4
