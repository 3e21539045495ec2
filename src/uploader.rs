//! Chunk uploader
//!
//! One uploader per profile drains a queue of file versions produced by the
//! indexer and the change manager. Chunks already on the remote store (by
//! checksum) are never uploaded again. Chunks are packed with the profile's
//! codec on the way out; the cache only holds raw chunks.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::context::{Context, Profile};
use crate::error::{StoreResult, SyncError};
use crate::logging::*;
use crate::metadata::{chunk_remote_name, FileVersion, MetadataStore, SyncStatus};
use crate::remote::RemoteName;
use crate::transfer::{connect_with_retry, TransferManager, CONNECT_ATTEMPTS, CONNECT_BACKOFF};

/// Sending side of an uploader's work queue
#[derive(Clone)]
pub struct UploadQueue {
	tx: mpsc::UnboundedSender<FileVersion>,
}

impl UploadQueue {
	pub fn channel() -> (UploadQueue, mpsc::UnboundedReceiver<FileVersion>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(UploadQueue { tx }, rx)
	}

	/// Queue a version; dropped silently once the uploader has stopped
	pub fn queue(&self, version: FileVersion) {
		if self.tx.send(version).is_err() {
			debug!("Uploader stopped, not queueing");
		}
	}
}

/// Versions of the given roots that never reached the remote store, oldest first
pub fn pending_versions(store: &dyn MetadataStore, root_ids: &[String]) -> StoreResult<Vec<FileVersion>> {
	let history = store.get_history(root_ids)?;
	Ok(history
		.into_iter()
		.filter(|v| matches!(v.sync_status, SyncStatus::Local | SyncStatus::Syncing))
		.collect())
}

/// What processing one version did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
	pub uploaded_chunks: usize,
	pub skipped_chunks: usize,
}

struct RemoteChunks {
	fetched: Instant,
	checksums: HashSet<String>,
}

pub struct Uploader {
	ctx: Arc<Context>,
	profile: Arc<Profile>,
	ttl: Duration,
	remote: Mutex<Option<RemoteChunks>>,
}

impl Uploader {
	pub fn new(ctx: Arc<Context>, profile: Arc<Profile>) -> Self {
		let ttl = ctx.config.remote_list_ttl();
		Uploader { ctx, profile, ttl, remote: Mutex::new(None) }
	}

	/// Drain the queue until cancelled
	pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FileVersion>, cancel: CancellationToken) {
		info!("Uploader for profile {} started", self.profile.name);
		loop {
			let version = tokio::select! {
				_ = cancel.cancelled() => break,
				v = rx.recv() => match v {
					Some(v) => v,
					None => break,
				},
			};

			debug!("Uploading {} ({})", version.relative_path(), version.key());
			if let Err(e) = self.process(&version).await {
				error!("Upload of {} ({}) aborted: {}", version.relative_path(), version.key(), e);
				self.ctx.observer.on_error(&e);
			}
		}
		info!("Uploader for profile {} stopped", self.profile.name);
	}

	/// Upload the missing chunks of one version and mark it up to date
	pub async fn process(&self, version: &FileVersion) -> Result<UploadOutcome, SyncError> {
		let store = &self.ctx.store;
		if !version.folder {
			store.set_sync_status(version.key(), SyncStatus::Syncing)?;
		}

		let mut outcome = UploadOutcome::default();
		if !version.folder && version.is_live() && !version.chunks.is_empty() {
			let tm = self.profile.transfer.as_ref();
			connect_with_retry(tm, CONNECT_ATTEMPTS, CONNECT_BACKOFF).await?;
			let result = self.upload_chunks(tm, version, &mut outcome).await;
			if let Err(e) = tm.disconnect().await {
				debug!("Disconnecting from {} failed: {}", tm.location(), e);
			}
			result?;
		}

		store.set_sync_status(version.key(), SyncStatus::UpToDate)?;
		self.propagate_up_to_date(version)?;
		self.ctx.observer.on_uploaded(version);
		debug!(
			"{} is up to date ({} chunks uploaded, {} already remote)",
			version.relative_path(),
			outcome.uploaded_chunks,
			outcome.skipped_chunks
		);
		Ok(outcome)
	}

	async fn upload_chunks(
		&self,
		tm: &dyn TransferManager,
		version: &FileVersion,
		outcome: &mut UploadOutcome,
	) -> Result<(), SyncError> {
		let mut remote = self.remote_chunks(tm).await?;
		let checksums = &mut remote
			.as_mut()
			.ok_or_else(|| SyncError::Other { message: "remote chunk list unavailable".to_string() })?
			.checksums;

		for checksum in &version.chunks {
			if checksums.contains(checksum) {
				outcome.skipped_chunks += 1;
				continue;
			}
			let packed = self.profile.codec.pack(&self.ctx.cache.read(checksum)?);
			let temp = self.ctx.cache.temp_path("chunk");
			let result = match fs::write(&temp, &packed) {
				Ok(()) => tm.upload(&temp, &chunk_remote_name(checksum)).await.map_err(SyncError::from),
				Err(e) => Err(e.into()),
			};
			let _ = fs::remove_file(&temp);
			result?;
			trace!("Uploaded chunk {}", checksum);
			checksums.insert(checksum.clone());
			outcome.uploaded_chunks += 1;
		}
		Ok(())
	}

	/// Cached remote chunk listing, refreshed when older than the TTL
	async fn remote_chunks(
		&self,
		tm: &dyn TransferManager,
	) -> Result<tokio::sync::MutexGuard<'_, Option<RemoteChunks>>, SyncError> {
		let mut guard = self.remote.lock().await;
		let stale = guard.as_ref().map_or(true, |r| r.fetched.elapsed() >= self.ttl);
		if stale {
			let listing = tm.list(Some("chunk-")).await?;
			let checksums: HashSet<String> = listing
				.keys()
				.filter_map(|name| match RemoteName::parse(name) {
					Some(RemoteName::Chunk { checksum }) => Some(checksum),
					_ => None,
				})
				.collect();
			debug!("Refreshed remote chunk list: {} chunks", checksums.len());
			*guard = Some(RemoteChunks { fetched: Instant::now(), checksums });
		}
		Ok(guard)
	}

	/// Mark ancestor folders up to date until one already is
	fn propagate_up_to_date(&self, version: &FileVersion) -> Result<(), SyncError> {
		let store = &self.ctx.store;
		let mut next = version.parent.clone();
		while let Some(parent_ref) = next {
			let parent = match store.get_version(parent_ref.key())? {
				Some(p) => p,
				None => break,
			};
			if parent.sync_status == SyncStatus::UpToDate {
				break;
			}
			store.set_sync_status(parent.key(), SyncStatus::UpToDate)?;
			next = parent.parent;
		}
		Ok(())
	}
}

// vim: ts=4
