//! Synchronization cycle
//!
//! On every tick the remote watcher lists the remote store, refreshes the
//! repository descriptor, pulls the update files other clients published
//! since the last tick and hands them to the change manager, which records
//! them as read once they are applied. It then
//! publishes this machine's own history and profile, and removes the files
//! they superseded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::change_manager::{ChangeQueue, UpdateBatch};
use crate::context::{Context, Profile};
use crate::error::{RepositoryError, SyncError};
use crate::logging::*;
use crate::metadata::now_millis;
use crate::remote::{RemoteName, StructuredFileList};
use crate::repository::Repository;
use crate::transfer::{connect_with_retry, TransferManager, CONNECT_ATTEMPTS, CONNECT_BACKOFF};
use crate::update::{history_to_updates, read_update_file, write_update_file, UpdateList};

/// Payload of a `profile-<client>-<timestamp>` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFile {
	pub user_name: String,
	pub machine_name: String,
}

/// What one cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
	/// Update files downloaded from other clients
	pub update_files: usize,
	/// Updates handed to the change manager
	pub updates_queued: usize,
	pub published_update: Option<String>,
	pub published_profile: Option<String>,
	/// Superseded own files removed from the remote store
	pub removed: usize,
}

/// Integrity problems stop the profile; everything else is retried next tick
pub fn is_fatal(error: &SyncError) -> bool {
	matches!(error, SyncError::Repository(e) if !matches!(e, RepositoryError::Transfer(_)))
}

pub struct RemoteWatcher {
	ctx: Arc<Context>,
	profile: Arc<Profile>,
	changes: ChangeQueue,
	repository: Repository,
	/// Newest update file handed over per client in this session
	handed_over: HashMap<String, i64>,
	published_version_count: Option<u64>,
	profile_published: bool,
}

impl RemoteWatcher {
	pub fn new(ctx: Arc<Context>, profile: Arc<Profile>, changes: ChangeQueue) -> Self {
		let repository = Repository::new(profile.root_ids());
		RemoteWatcher {
			ctx,
			profile,
			changes,
			repository,
			handed_over: HashMap::new(),
			published_version_count: None,
			profile_published: false,
		}
	}

	/// Run a cycle on every tick until cancelled or the repository turns out to be unusable
	pub async fn run(mut self, cancel: CancellationToken, sync_interval: Duration) {
		info!("Remote watcher for profile {} started", self.profile.name);
		let mut ticker = tokio::time::interval(sync_interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}

			match self.sync_cycle().await {
				Ok(report) => debug!("Sync cycle of {} finished: {:?}", self.profile.name, report),
				Err(e) if is_fatal(&e) => {
					error!("Synchronization of profile {} stopped: {}", self.profile.name, e);
					self.ctx.observer.on_error(&e);
					break;
				}
				Err(e) => warn!("Sync cycle of {} failed, retrying on next tick: {}", self.profile.name, e),
			}
		}
		info!("Remote watcher for profile {} stopped", self.profile.name);
	}

	/// One full cycle: connect, exchange, always disconnect
	pub async fn sync_cycle(&mut self) -> Result<CycleReport, SyncError> {
		let tm = self.profile.transfer.clone();
		connect_with_retry(tm.as_ref(), CONNECT_ATTEMPTS, CONNECT_BACKOFF).await?;
		let result = self.exchange(tm.as_ref()).await;
		if let Err(e) = tm.disconnect().await {
			debug!("Disconnecting from {} failed: {}", tm.location(), e);
		}
		result
	}

	async fn exchange(&mut self, tm: &dyn TransferManager) -> Result<CycleReport, SyncError> {
		let mut report = CycleReport::default();
		let machine = self.ctx.machine_name.clone();
		let listing = tm.list(None).await?;
		let list = StructuredFileList::new(&machine, &listing);
		trace!("Listed {} remote files ({} chunks)", listing.len(), list.chunk_count());

		// Repository descriptor
		let codec = self.profile.codec.as_ref();
		self.repository.update(tm, &self.ctx.cache, codec, &list).await?;
		if self.repository.is_changed() {
			self.repository.commit(tm, &self.ctx.cache, codec, false).await?;
		}

		// Other clients' updates
		let store = &self.ctx.store;
		let mut update_list = UpdateList::new();
		let mut batch = UpdateBatch::default();
		for (client_name, file) in list.remote_update_files() {
			let client = store.get_or_create_client(client_name)?;
			let seen = client.last_update.max(self.handed_over.get(client_name.as_str()).copied());
			if seen.map_or(false, |last| last >= file.timestamp) {
				continue;
			}
			let packed = self.download(tm, &file.name).await?;
			match read_update_file(&packed, codec) {
				Ok(updates) => {
					debug!("Read {} updates from {}", updates.len(), file.name);
					update_list.add_update_file(client_name, updates);
					report.update_files += 1;
				}
				Err(e) => warn!("Ignoring unreadable update file {}: {}", file.name, e),
			}
			batch.sources.push((client_name.to_string(), file.timestamp));
		}

		if !batch.sources.is_empty() {
			batch.updates = update_list.generate();
			report.updates_queued = batch.updates.len();
			for (client_name, timestamp) in &batch.sources {
				self.handed_over.insert(client_name.clone(), *timestamp);
			}
			self.changes.queue(batch);
		}

		// Own history
		let version_count = store.version_count()?;
		let own_updates = list.local_update_files();
		if self.published_version_count != Some(version_count) || own_updates.is_empty() {
			let history = store.get_history(&self.profile.root_ids())?;
			let packed = write_update_file(&history_to_updates(&history), codec)?;
			let timestamp = next_timestamp(own_updates);
			let name = RemoteName::update(&machine, timestamp);
			self.upload(tm, &name, &packed).await?;
			info!("Published {} ({} versions)", name, history.len());
			self.published_version_count = Some(version_count);
			report.published_update = Some(name);
		}

		// Profiles
		for (client_name, file) in list.remote_profile_files() {
			let mut client = store.get_or_create_client(client_name)?;
			if client.last_profile_update.map_or(false, |last| last >= file.timestamp) {
				continue;
			}
			let packed = self.download(tm, &file.name).await?;
			match codec.unpack(&packed).map_err(SyncError::from).and_then(|raw| {
				serde_json::from_slice::<ProfileFile>(&raw)
					.map_err(|e| SyncError::Other { message: e.to_string() })
			}) {
				Ok(profile) => {
					debug!("Client {} belongs to {}", client_name, profile.user_name);
					client.user_name = Some(profile.user_name);
				}
				Err(e) => warn!("Ignoring unreadable profile file {}: {}", file.name, e),
			}
			client.last_profile_update = Some(file.timestamp);
			store.save_client(&client)?;
		}

		let own_profiles = list.local_profile_files();
		if !self.profile_published || own_profiles.is_empty() {
			let payload = ProfileFile { user_name: self.ctx.config.user_name.clone(), machine_name: machine.clone() };
			let raw = serde_json::to_vec(&payload).map_err(|e| SyncError::Other { message: e.to_string() })?;
			let name = RemoteName::profile(&machine, next_timestamp(own_profiles));
			self.upload(tm, &name, &codec.pack(&raw)).await?;
			debug!("Published {}", name);
			self.profile_published = true;
			report.published_profile = Some(name);
		}

		// Superseded own files
		let mut stale = superseded(own_updates, report.published_update.is_some());
		stale.extend(superseded(own_profiles, report.published_profile.is_some()));
		stale.extend(superseded(list.local_image_files(), false));
		for name in stale {
			match tm.delete(name).await {
				Ok(()) => report.removed += 1,
				Err(e) => debug!("Cannot remove {}: {}", name, e),
			}
		}

		Ok(report)
	}

	async fn download(&self, tm: &dyn TransferManager, name: &str) -> Result<Vec<u8>, SyncError> {
		let temp = self.ctx.cache.temp_path("download");
		let result = match tm.download(name, &temp).await {
			Ok(()) => fs::read(&temp).map_err(SyncError::from),
			Err(e) => Err(e.into()),
		};
		let _ = fs::remove_file(&temp);
		result
	}

	async fn upload(&self, tm: &dyn TransferManager, name: &str, packed: &[u8]) -> Result<(), SyncError> {
		let temp = self.ctx.cache.temp_path("upload");
		let result = match fs::write(&temp, packed) {
			Ok(()) => tm.upload(&temp, name).await.map_err(SyncError::from),
			Err(e) => Err(e.into()),
		};
		let _ = fs::remove_file(&temp);
		result
	}
}

/// A timestamp after every own file of the same kind
fn next_timestamp(own: &BTreeMap<i64, String>) -> i64 {
	let newest = own.keys().next_back().copied().unwrap_or(0);
	now_millis().max(newest + 1)
}

/// Own files to delete: all of them when a newer one was just published, else all but the newest
fn superseded(own: &BTreeMap<i64, String>, published: bool) -> Vec<&str> {
	let keep = if published { 0 } else { 1 };
	let count = own.len().saturating_sub(keep);
	own.values().take(count).map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn own(timestamps: &[i64]) -> BTreeMap<i64, String> {
		timestamps.iter().map(|t| (*t, RemoteName::update("alpha", *t))).collect()
	}

	#[test]
	fn test_superseded_keeps_newest() {
		let files = own(&[3, 1, 2]);
		assert_eq!(superseded(&files, false), vec!["update-alpha-1", "update-alpha-2"]);
		assert_eq!(superseded(&files, true).len(), 3);
		assert!(superseded(&own(&[]), false).is_empty());
	}

	#[test]
	fn test_next_timestamp_is_monotonic() {
		let far_future = now_millis() + 1_000_000;
		assert_eq!(next_timestamp(&own(&[far_future])), far_future + 1);
		assert!(next_timestamp(&own(&[])) > 0);
	}

	#[test]
	fn test_fatal_errors() {
		assert!(is_fatal(&RepositoryError::NoRepositoryFound.into()));
		assert!(is_fatal(&RepositoryError::InvalidRepository { message: "v2".to_string() }.into()));
		let transfer = crate::error::TransferError::ConnectFailed { location: "x".to_string(), message: "y".to_string() };
		assert!(!is_fatal(&RepositoryError::Transfer(transfer).into()));
		assert!(!is_fatal(&SyncError::Other { message: "z".to_string() }));
	}

	#[test]
	fn test_profile_file_json() {
		let p = ProfileFile { user_name: "Ann".to_string(), machine_name: "alpha".to_string() };
		let json = serde_json::to_string(&p).unwrap();
		assert_eq!(json, r#"{"userName":"Ann","machineName":"alpha"}"#);
	}
}

// vim: ts=4
