//! Applying remote updates
//!
//! The change manager takes the merged update lists produced by the sync
//! cycle, orders them through a [`DependencyQueue`] and applies them one by
//! one to the metadata store and the local filesystem.
//!
//! For each update:
//!
//! - If this machine already has the same `(file id, version)` and the two
//!   agree, or the local version came first, nothing happens.
//! - If the local one conflicts and lost, the local chain from that version
//!   on is re-homed as a new file ("conflicting copy") and the remote update
//!   is applied.
//! - If the file id is unknown, the update may collide with an independent
//!   local file at the same path. Equal content merges the two histories,
//!   different content forks the loser into a conflicting copy.
//! - A version whose location belongs to another live file is recorded with
//!   [`SyncStatus::Conflict`] and never written there; its content goes to a
//!   conflicting copy under a file id of its own.
//!
//! Filesystem changes always go through `.ignore*` temporary names and the
//! paths involved are claimed in [`BusyPaths`](crate::context::BusyPaths)
//! while they are written. Versions are persisted once the filesystem holds
//! their content.
//!
//! The update files a batch was read from are recorded as read only after
//! every update of the batch has been applied, so a stop in between reads
//! them again on the next start.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::callbacks::{summarize, Notification};
use crate::chunking::checksum as content_checksum;
use crate::context::{Context, Profile, Root};
use crate::dependency_queue::{prerequisites, DependencyQueue};
use crate::error::{ChunkError, SyncError, TransferError};
use crate::logging::*;
use crate::metadata::{chunk_remote_name, new_file_id, FileKey, FileStatus, FileVersion, SyncStatus};
use crate::transfer::{connect_with_retry, CONNECT_ATTEMPTS, CONNECT_BACKOFF};
use crate::update::Update;
use crate::uploader::UploadQueue;
use crate::util::{
	conflicting_copy_name, delete_via, rename_via, set_mtime_millis, via_path, ASSEMBLE_VIA_PREFIX, RENAME_VIA_PREFIX,
};

// ============================================================================
// QUEUE AND RESULTS
// ============================================================================

/// Updates read in one sync cycle and the update files they came from
#[derive(Debug, Default)]
pub struct UpdateBatch {
	pub updates: Vec<Update>,
	/// `(client, timestamp)` of every update file read
	pub sources: Vec<(String, i64)>,
}

impl UpdateBatch {
	pub fn is_empty(&self) -> bool {
		self.updates.is_empty() && self.sources.is_empty()
	}

	fn append(&mut self, other: UpdateBatch) {
		self.updates.extend(other.updates);
		self.sources.extend(other.sources);
	}
}

/// Sending side of the change manager's inbox
#[derive(Clone)]
pub struct ChangeQueue {
	tx: mpsc::UnboundedSender<UpdateBatch>,
}

impl ChangeQueue {
	pub fn channel() -> (ChangeQueue, mpsc::UnboundedReceiver<UpdateBatch>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(ChangeQueue { tx }, rx)
	}

	pub fn queue(&self, batch: UpdateBatch) {
		if self.tx.send(batch).is_err() {
			debug!("Change manager stopped, dropping update list");
		}
	}
}

/// Counters of one apply run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
	pub applied: usize,
	pub skipped: usize,
	/// Conflicting copies and merges created
	pub conflicts: usize,
	/// Failed or blocked updates kept for the next run
	pub deferred: usize,
	pub notification: Option<Notification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
	Skipped,
	Done,
	Conflict,
}

// ============================================================================
// CONFLICT DETECTION
// ============================================================================

/// Whether the local version with the same key as `update` has to give way.
///
/// Agreeing versions never conflict. Otherwise the older `updated` wins, ties
/// going to the lexicographically greater client name.
pub fn is_local_conflict(local: Option<&FileVersion>, update: &Update, machine_name: &str) -> bool {
	let local = match local {
		Some(l) => l,
		None => return false,
	};

	let agree = match (local.status, update.status) {
		(FileStatus::Deleted, FileStatus::Deleted) => true,
		(FileStatus::Merged, FileStatus::Merged) => {
			local.merged_to.as_ref().map(|m| m.file_id) == update.merged_to.as_ref().map(|m| m.file_id)
		}
		(FileStatus::Renamed, FileStatus::Renamed) => local.path == update.path && local.name == update.name,
		(FileStatus::New, FileStatus::New) | (FileStatus::Changed, FileStatus::Changed) => {
			local.size == update.size
				&& local.checksum == update.checksum
				&& local.path == update.path
				&& local.name == update.name
		}
		_ => false,
	};
	if agree {
		return false;
	}

	if local.updated < update.updated {
		return false;
	}
	if local.updated == update.updated && machine_name > update.client_name.as_str() {
		return false;
	}
	true
}

// ============================================================================
// CHANGE MANAGER
// ============================================================================

/// Stored versions that are not on disk at their own location
fn is_materialized(version: &FileVersion) -> bool {
	version.sync_status != SyncStatus::Conflict
}

pub struct ChangeManager {
	ctx: Arc<Context>,
	profile: Arc<Profile>,
	uploads: UploadQueue,
	deferred: Vec<Update>,
	/// Newest update file per client read but not yet fully applied
	unconfirmed: BTreeMap<String, i64>,
	connected: AtomicBool,
}

impl ChangeManager {
	pub fn new(ctx: Arc<Context>, profile: Arc<Profile>, uploads: UploadQueue) -> Self {
		ChangeManager {
			ctx,
			profile,
			uploads,
			deferred: Vec::new(),
			unconfirmed: BTreeMap::new(),
			connected: AtomicBool::new(false),
		}
	}

	/// Collect queued batches and apply them on every tick until cancelled
	pub async fn run(
		mut self,
		mut rx: mpsc::UnboundedReceiver<UpdateBatch>,
		cancel: CancellationToken,
		apply_interval: Duration,
	) {
		info!("Change manager for profile {} started", self.profile.name);
		let mut pending = UpdateBatch::default();
		let mut ticker = tokio::time::interval(apply_interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				batch = rx.recv() => match batch {
					Some(batch) => pending.append(batch),
					None => break,
				},
				_ = ticker.tick() => {
					if pending.is_empty() && self.deferred.is_empty() {
						continue;
					}
					let batch = std::mem::take(&mut pending);
					let summary = self.apply_batch(batch).await;
					debug!("Apply run finished: {:?}", summary);
				}
			}
		}
		let left = pending.updates.len() + self.deferred.len();
		if left > 0 {
			info!("Stopping with {} updates not applied; their update files are read again on the next start", left);
		}
		info!("Change manager for profile {} stopped", self.profile.name);
	}

	/// Apply the updates of a sync cycle. Once nothing is deferred any more,
	/// the update files seen so far are recorded as read.
	pub async fn apply_batch(&mut self, batch: UpdateBatch) -> ApplySummary {
		for (client, timestamp) in batch.sources {
			let mark = self.unconfirmed.entry(client).or_insert(timestamp);
			*mark = (*mark).max(timestamp);
		}
		let summary = self.apply_updates(batch.updates).await;
		if self.deferred.is_empty() {
			if let Err(e) = self.confirm_read() {
				warn!("Cannot record read update files: {}", e);
			}
		}
		summary
	}

	fn confirm_read(&mut self) -> Result<(), SyncError> {
		let store = &self.ctx.store;
		for (name, timestamp) in &self.unconfirmed {
			let mut client = store.get_or_create_client(name)?;
			if client.last_update.map_or(true, |last| last < *timestamp) {
				client.last_update = Some(*timestamp);
				store.save_client(&client)?;
				trace!("Update files of {} read up to {}", name, timestamp);
			}
		}
		self.unconfirmed.clear();
		Ok(())
	}

	/// Apply a list of updates, together with anything deferred before
	pub async fn apply_updates(&mut self, updates: Vec<Update>) -> ApplySummary {
		let mut queue = DependencyQueue::new();
		for update in self.deferred.drain(..).chain(updates) {
			queue.add(update);
		}

		let mut summary = ApplySummary::default();
		let mut failed: HashSet<FileKey> = HashSet::new();
		let mut deferred = Vec::new();
		let mut applied: BTreeMap<u64, Vec<Update>> = BTreeMap::new();

		while let Some(update) = queue.poll() {
			if prerequisites(&update).iter().any(|k| failed.contains(k)) {
				debug!("Deferring {} behind a failed prerequisite", update.key());
				failed.insert(update.key());
				deferred.push(update);
				continue;
			}

			match self.apply_update(&update).await {
				Ok(Applied::Skipped) => summary.skipped += 1,
				Ok(outcome) => {
					if outcome == Applied::Conflict {
						summary.conflicts += 1;
					}
					summary.applied += 1;
					applied.entry(update.file_id).or_default().push(update);
				}
				Err(e) => {
					warn!("Cannot apply {} ({}): {}", update.key(), update.name, e);
					self.ctx.observer.on_error(&e);
					failed.insert(update.key());
					deferred.push(update);
				}
			}
		}

		for update in queue.drain_blocked() {
			warn!("Dropping update {} caught in a dependency cycle", update.key());
			summary.skipped += 1;
		}

		if self.connected.swap(false, Ordering::Relaxed) {
			let tm = self.profile.transfer.as_ref();
			if let Err(e) = tm.disconnect().await {
				debug!("Disconnecting from {} failed: {}", tm.location(), e);
			}
		}

		summary.deferred = deferred.len();
		self.deferred = deferred;

		summary.notification = summarize(&applied, |client| self.display_name(client));
		if let Some(notification) = &summary.notification {
			self.ctx.observer.on_updates_applied(notification);
		}
		if summary.applied > 0 || summary.deferred > 0 {
			info!(
				"Applied {} updates ({} conflicts, {} skipped, {} deferred)",
				summary.applied, summary.conflicts, summary.skipped, summary.deferred
			);
		}
		summary
	}

	fn display_name(&self, client: &str) -> String {
		match self.ctx.store.get_client(client) {
			Ok(Some(c)) => c.user_name.unwrap_or_else(|| client.to_string()),
			_ => client.to_string(),
		}
	}

	async fn apply_update(&self, update: &Update) -> Result<Applied, SyncError> {
		let root = match self.profile.root(&update.root_id) {
			Some(r) => r,
			None => {
				debug!("Skipping {}: root {} is not synchronized here", update.key(), update.root_id);
				return Ok(Applied::Skipped);
			}
		};
		if !update.has_valid_location() {
			warn!("Skipping {}: '{}' in '{}' is outside the synchronized folder", update.key(), update.name, update.path);
			return Ok(Applied::Skipped);
		}
		let store = &self.ctx.store;

		let local = store.get_version(update.key())?;
		if is_local_conflict(local.as_ref(), update, &self.ctx.machine_name) {
			info!("Local {} ({}) conflicts with {}'s version", update.key(), update.name, update.client_name);
			self.rehome_local_chain(root, update).await?;
			self.apply(root, update).await?;
			return Ok(Applied::Conflict);
		}
		if local.is_some() {
			trace!("{} already applied", update.key());
			return Ok(Applied::Skipped);
		}

		if store.get_latest(update.file_id)?.is_some() {
			self.apply(root, update).await
		} else {
			self.apply_unknown(root, update).await
		}
	}

	/// Another live file holding `version`'s location
	fn occupant(&self, root: &Root, version: &FileVersion) -> Result<Option<FileVersion>, SyncError> {
		Ok(self
			.ctx
			.store
			.find_by_path(&root.remote_id, &version.path, &version.name, None)?
			.filter(|v| v.file_id != version.file_id))
	}

	// ------------------------------------------------------------------------
	// Known file ids
	// ------------------------------------------------------------------------

	async fn apply(&self, root: &Root, update: &Update) -> Result<Applied, SyncError> {
		let store = &self.ctx.store;
		let previous = match update.previous_key() {
			Some(key) => store.get_version(key)?,
			None => None,
		};
		let mut version = update.to_file_version(previous.as_ref())?;
		// Only a previous version on disk at its own location can be moved or replaced
		let placed = previous.filter(is_materialized);

		match version.status {
			FileStatus::Merged => {
				version.sync_status = SyncStatus::UpToDate;
				store.save_version(&version)?;
				Ok(Applied::Done)
			}
			FileStatus::Renamed => match placed {
				Some(prev) => self.apply_rename(root, version, &prev).await,
				None => self.apply_content(root, version, None).await,
			},
			FileStatus::Deleted => {
				let target = placed.map(|prev| prev.local_path(&root.local_path));
				let _busy = self.ctx.busy.claim(target.clone());
				if let Some(target) = target.filter(|t| fs::symlink_metadata(t).is_ok()) {
					delete_via(&target)?;
					debug!("Deleted {}", version.relative_path());
				}
				version.sync_status = SyncStatus::UpToDate;
				store.save_version(&version)?;
				Ok(Applied::Done)
			}
			FileStatus::New | FileStatus::Changed => self.apply_content(root, version, placed.as_ref()).await,
		}
	}

	async fn apply_rename(&self, root: &Root, mut version: FileVersion, previous: &FileVersion) -> Result<Applied, SyncError> {
		let from = previous.local_path(&root.local_path);
		let to = version.local_path(&root.local_path);

		if fs::symlink_metadata(&from).is_err() {
			// Moved along with a renamed folder
			if already_in_place(&to, &version) && self.occupant(root, &version)?.is_none() {
				version.sync_status = SyncStatus::UpToDate;
				self.ctx.store.save_version(&version)?;
				return Ok(Applied::Done);
			}
			return self.apply_content(root, version, Some(previous)).await;
		}
		if from != to && (self.occupant(root, &version)?.is_some() || fs::symlink_metadata(&to).is_ok()) {
			warn!("Cannot rename {} to {}: target exists", previous.relative_path(), version.relative_path());
			return self.fork(root, version, Some(&from)).await;
		}

		let _busy = self.ctx.busy.claim(vec![from.clone(), to.clone()]);
		if from != to {
			if let Some(dir) = to.parent() {
				fs::create_dir_all(dir)?;
			}
			rename_via(&from, &to, RENAME_VIA_PREFIX)?;
		}
		if !version.folder {
			set_mtime_millis(&to, version.last_modified)?;
		}
		version.sync_status = SyncStatus::UpToDate;
		self.ctx.store.save_version(&version)?;
		debug!("Renamed {} to {}", previous.relative_path(), version.relative_path());
		Ok(Applied::Done)
	}

	/// Materialize a NEW or CHANGED version at its path
	async fn apply_content(
		&self,
		root: &Root,
		mut version: FileVersion,
		previous: Option<&FileVersion>,
	) -> Result<Applied, SyncError> {
		if let Some(owner) = self.occupant(root, &version)? {
			debug!("{} belongs to file {}", version.relative_path(), owner.file_id);
			let on_disk = fs::symlink_metadata(owner.local_path(&root.local_path)).is_ok();
			if on_disk && owner.folder == version.folder && owner.checksum == version.checksum {
				// The content is already there under another history
				let owner_first = self.started_first(&owner, &version)?;
				self.merge(root, &owner, &mut version, owner_first)?;
				return Ok(Applied::Conflict);
			}
			return self.fork(root, version, None).await;
		}
		let target = version.local_path(&root.local_path);
		if !version.folder && previous.is_none() && fs::symlink_metadata(&target).is_ok() {
			// Retried once the indexer has seen the local file
			return Err(SyncError::Other {
				message: format!("{} exists locally but is not indexed yet", version.relative_path()),
			});
		}

		let old = previous.map(|prev| prev.local_path(&root.local_path)).filter(|old| *old != target);
		let _busy = self.ctx.busy.claim(std::iter::once(target.clone()).chain(old.clone()));
		let staged = self.stage(&version, &target).await?;
		if let (Some(old), Some(prev)) = (&old, previous) {
			if !prev.folder && fs::symlink_metadata(old).is_ok() {
				delete_via(old)?;
			}
		}
		if let Some(staged) = staged {
			fs::rename(&staged, &target)?;
		}
		version.sync_status = SyncStatus::UpToDate;
		self.ctx.store.save_version(&version)?;
		debug!("Wrote {} v{}", version.relative_path(), version.version);
		Ok(Applied::Done)
	}

	/// Record `version` without writing it to its location, and give its
	/// content to a conflicting copy owned by this machine.
	///
	/// The copy is named after the version and the client that started its
	/// history, so later versions of the same history land in the same copy.
	/// With `from` set, the file there holds the content and is moved.
	async fn fork(&self, root: &Root, mut version: FileVersion, from: Option<&Path>) -> Result<Applied, SyncError> {
		let store = &self.ctx.store;
		let machine = &self.ctx.machine_name;
		let first = store.get_version(FileKey::new(version.file_id, 1))?.unwrap_or_else(|| version.clone());
		let copy_name = conflicting_copy_name(&version.name, &first.client_name, first.updated);

		let existing = store
			.find_by_path(&root.remote_id, &version.path, &copy_name, Some(version.folder))?
			.filter(|v| v.file_id != version.file_id);
		let copy = match existing {
			Some(copy) if copy.folder => None,
			Some(copy) => {
				let mut next = copy.next_version(FileStatus::Changed, machine);
				next.size = version.size;
				next.last_modified = version.last_modified;
				next.checksum = version.checksum.clone();
				next.chunks = version.chunks.clone();
				Some(next)
			}
			None => {
				let mut copy = FileVersion::new_file(&version.root_id, &version.path, &copy_name, version.folder, machine);
				copy.size = version.size;
				copy.last_modified = version.last_modified;
				copy.checksum = version.checksum.clone();
				copy.chunks = version.chunks.clone();
				copy.parent = version.parent.clone();
				Some(copy)
			}
		};

		let original = version.local_path(&root.local_path);
		let target = FileVersion { name: copy_name.clone(), ..version.clone() }.local_path(&root.local_path);
		if let Some(copy) = &copy {
			let _busy = self.ctx.busy.claim(std::iter::once(target.clone()).chain(from.map(Path::to_path_buf)));
			match from {
				Some(from) if copy.version == 1 && !copy.folder => rename_via(from, &target, RENAME_VIA_PREFIX)?,
				_ => {
					if let Some(staged) = self.stage(copy, &target).await? {
						fs::rename(&staged, &target)?;
					}
					if let Some(from) = from.filter(|_| !copy.folder) {
						delete_via(from)?;
					}
				}
			}
		}

		version.sync_status = SyncStatus::Conflict;
		let mut versions = vec![version.clone()];
		versions.extend(copy.iter().cloned());
		store.save_versions(&versions)?;

		info!("{}'s {} kept as {}", version.client_name, version.relative_path(), copy_name);
		self.ctx.observer.on_conflicting_copy(&original, &target);
		if let Some(copy) = copy {
			self.uploads.queue(copy);
		}
		Ok(Applied::Conflict)
	}

	/// Prepare `version`'s content next to `target`.
	///
	/// Folders are created directly and yield None; files are assembled into a
	/// temporary sibling which is returned for the final rename.
	async fn stage(&self, version: &FileVersion, target: &Path) -> Result<Option<PathBuf>, SyncError> {
		if let Some(dir) = target.parent() {
			fs::create_dir_all(dir)?;
		}
		if version.folder {
			if !target.is_dir() {
				let temp = via_path(target, RENAME_VIA_PREFIX);
				fs::create_dir_all(&temp)?;
				fs::rename(&temp, target)?;
			}
			return Ok(None);
		}

		self.fetch_chunks(&version.chunks).await?;
		let temp = via_path(target, ASSEMBLE_VIA_PREFIX);
		if let Err(e) = self.assemble(version, &temp) {
			let _ = fs::remove_file(&temp);
			return Err(e);
		}
		Ok(Some(temp))
	}

	/// Download the chunks missing from the cache
	async fn fetch_chunks(&self, chunks: &[String]) -> Result<usize, SyncError> {
		let mut seen = HashSet::new();
		let missing: Vec<&String> =
			chunks.iter().filter(|c| seen.insert(c.as_str()) && !self.ctx.cache.contains(c)).collect();
		if missing.is_empty() {
			return Ok(0);
		}

		let tm = self.profile.transfer.as_ref();
		if !self.connected.load(Ordering::Relaxed) {
			connect_with_retry(tm, CONNECT_ATTEMPTS, CONNECT_BACKOFF).await?;
			self.connected.store(true, Ordering::Relaxed);
		}

		for checksum in &missing {
			let temp = self.ctx.cache.temp_path("chunk");
			let result = match tm.download(&chunk_remote_name(checksum), &temp).await {
				Ok(()) => fs::read(&temp).map_err(SyncError::from).and_then(|packed| self.cache_chunk(checksum, &packed)),
				Err(TransferError::NotFound { .. }) => {
					Err(ChunkError::Missing { checksum: checksum.to_string() }.into())
				}
				Err(e) => Err(e.into()),
			};
			let _ = fs::remove_file(&temp);
			result?;
			self.ctx.store.get_or_create_chunk(checksum)?;
			trace!("Downloaded chunk {}", checksum);
		}
		debug!("Downloaded {} chunks", missing.len());
		Ok(missing.len())
	}

	/// Unpack a downloaded chunk, check it against its id and cache it raw
	fn cache_chunk(&self, checksum: &str, packed: &[u8]) -> Result<(), SyncError> {
		let raw = self.profile.codec.unpack(packed)?;
		let actual = content_checksum(&raw);
		if actual != checksum {
			return Err(SyncError::Other { message: format!("Chunk {} is corrupt: content hashes to {}", checksum, actual) });
		}
		Ok(self.ctx.cache.store(checksum, &raw)?)
	}

	/// Write the cached chunks in order and verify the whole-file checksum
	fn assemble(&self, version: &FileVersion, temp: &Path) -> Result<(), SyncError> {
		let mut file = fs::File::create(temp)?;
		let mut hasher = blake3::Hasher::new();
		for checksum in &version.chunks {
			let raw = self.ctx.cache.read(checksum)?;
			hasher.update(&raw);
			file.write_all(&raw)?;
		}
		file.sync_all()?;
		drop(file);

		let actual = hasher.finalize().to_hex().to_string();
		if !version.checksum.is_empty() && actual != version.checksum {
			return Err(SyncError::Other {
				message: format!(
					"Checksum mismatch assembling {}: expected {}, got {}",
					version.relative_path(),
					version.checksum,
					actual
				),
			});
		}
		set_mtime_millis(temp, version.last_modified)?;
		Ok(())
	}

	/// Move the local chain from the conflicting version on to a new file id
	async fn rehome_local_chain(&self, root: &Root, update: &Update) -> Result<(), SyncError> {
		let store = &self.ctx.store;
		let machine = &self.ctx.machine_name;
		let chain: Vec<FileVersion> =
			store.get_versions(update.file_id)?.into_iter().filter(|v| v.version >= update.version).collect();
		let last = match chain.last() {
			Some(v) => v.clone(),
			None => return Ok(()),
		};

		let new_id = new_file_id();
		let replacement: Vec<FileVersion> = chain
			.iter()
			.enumerate()
			.map(|(i, v)| {
				let mut copy = v.clone();
				copy.file_id = new_id;
				copy.version = i as u32 + 1;
				if i == 0 {
					copy.status = FileStatus::New;
				}
				copy.sync_status = SyncStatus::Local;
				copy.name = conflicting_copy_name(&v.name, machine, v.updated);
				copy
			})
			.collect();

		store.rewrite_chain(update.file_id, update.version, &replacement)?;

		if let Some(copy) = replacement.last() {
			let original = last.local_path(&root.local_path);
			let renamed = copy.local_path(&root.local_path);
			if last.is_live() && is_materialized(&last) && fs::symlink_metadata(&original).is_ok() {
				rename_via(&original, &renamed, RENAME_VIA_PREFIX)?;
				self.ctx.observer.on_conflicting_copy(&original, &renamed);
			}
			info!("Local changes to {} kept as {}", last.relative_path(), copy.relative_path());
		}
		for version in replacement {
			self.uploads.queue(version);
		}
		Ok(())
	}

	// ------------------------------------------------------------------------
	// Unknown file ids
	// ------------------------------------------------------------------------

	async fn apply_unknown(&self, root: &Root, update: &Update) -> Result<Applied, SyncError> {
		let store = &self.ctx.store;
		let machine = &self.ctx.machine_name;
		let local = match store.find_by_path(&root.remote_id, &update.path, &update.name, None)? {
			Some(l) => l,
			None => return self.apply(root, update).await,
		};

		let local_path = local.local_path(&root.local_path);
		if fs::symlink_metadata(&local_path).is_err() {
			debug!("{} is gone locally, recording the deletion first", local.relative_path());
			store.save_version(&local.next_version(FileStatus::Deleted, machine))?;
			return self.apply(root, update).await;
		}

		let previous = match update.previous_key() {
			Some(key) => store.get_version(key)?,
			None => None,
		};
		let mut remote = update.to_file_version(previous.as_ref())?;
		let local_wins = self.started_first(&local, &remote)?;

		if local.folder == update.folder && local.checksum == update.checksum {
			self.merge(root, &local, &mut remote, local_wins)?;
			return Ok(Applied::Conflict);
		}

		if local_wins {
			// Keep ours in place; theirs goes to a copy with a file id of its own
			return self.fork(root, remote, None).await;
		}

		// Theirs takes the path; ours moves aside, named the way the other side names its copy
		let local_first = store.get_version(FileKey::new(local.file_id, 1))?.unwrap_or_else(|| local.clone());
		let mut moved = local.next_version(FileStatus::Renamed, machine);
		moved.name = conflicting_copy_name(&local.name, &local_first.client_name, local_first.updated);
		let moved_path = moved.local_path(&root.local_path);
		let target = remote.local_path(&root.local_path);
		let _busy = self.ctx.busy.claim(vec![local_path.clone(), moved_path.clone(), target.clone()]);

		let staged = if remote.folder { None } else { self.stage(&remote, &target).await? };
		if let Err(e) = rename_via(&local_path, &moved_path, RENAME_VIA_PREFIX) {
			if let Some(staged) = &staged {
				let _ = fs::remove_file(staged);
			}
			return Err(e.into());
		}
		match staged {
			Some(staged) => fs::rename(&staged, &target)?,
			None => {
				self.stage(&remote, &target).await?;
			}
		}

		remote.sync_status = SyncStatus::UpToDate;
		store.save_versions(&[moved.clone(), remote.clone()])?;
		info!("Local {} kept as {}", local.relative_path(), moved.relative_path());
		self.ctx.observer.on_conflicting_copy(&target, &moved_path);
		self.uploads.queue(moved);
		Ok(Applied::Conflict)
	}

	/// Whether the history `local` belongs to started before the one of `remote`.
	/// Ties go to the lexicographically smaller client name.
	fn started_first(&self, local: &FileVersion, remote: &FileVersion) -> Result<bool, SyncError> {
		let store = &self.ctx.store;
		let local_first = store.get_version(FileKey::new(local.file_id, 1))?.unwrap_or_else(|| local.clone());
		let remote_first = store.get_version(FileKey::new(remote.file_id, 1))?.unwrap_or_else(|| remote.clone());
		Ok((local_first.updated, local_first.client_name.as_str())
			< (remote_first.updated, remote_first.client_name.as_str()))
	}

	/// Join two independently created histories with the same content
	fn merge(&self, root: &Root, local: &FileVersion, remote: &mut FileVersion, local_wins: bool) -> Result<(), SyncError> {
		let store = &self.ctx.store;
		remote.sync_status = SyncStatus::UpToDate;

		if local_wins || remote.status == FileStatus::Merged {
			if remote.is_live() {
				// Ours keeps the location
				remote.sync_status = SyncStatus::Conflict;
			}
			store.save_version(remote)?;
			debug!("Recorded {}'s copy of {}", remote.client_name, remote.relative_path());
			return Ok(());
		}

		let mut merged = local.next_version(FileStatus::Merged, &self.ctx.machine_name);
		merged.merged_to = Some(remote.version_ref());
		store.save_versions(&[remote.clone(), merged.clone()])?;
		if !remote.folder {
			set_mtime_millis(&remote.local_path(&root.local_path), remote.last_modified)?;
		}
		info!("Merged local {} into {}'s history", local.relative_path(), remote.client_name);
		self.uploads.queue(merged);
		Ok(())
	}
}

fn already_in_place(path: &Path, version: &FileVersion) -> bool {
	match fs::symlink_metadata(path) {
		Ok(meta) => meta.is_dir() == version.folder && (version.folder || meta.len() == version.size),
		Err(_) => false,
	}
}


// vim: ts=4
