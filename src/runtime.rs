//! Per-profile worker set
//!
//! A running profile is four tasks sharing one cancellation token: the
//! indexer, the uploader, the change manager and the remote watcher.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::change_manager::{ChangeManager, ChangeQueue};
use crate::context::{Context, Profile};
use crate::indexer::{Indexer, IndexerHandle, WatchListener};
use crate::logging::*;
use crate::remote_watcher::RemoteWatcher;
use crate::uploader::{pending_versions, UploadQueue, Uploader};

pub struct ProfileRuntime {
	name: String,
	cancel: CancellationToken,
	indexer: IndexerHandle,
	tasks: Vec<JoinHandle<()>>,
}

impl ProfileRuntime {
	/// Spawn the workers of a profile on the current tokio runtime
	pub fn start(ctx: Arc<Context>, profile: Arc<Profile>) -> ProfileRuntime {
		let cancel = CancellationToken::new();
		let config = &ctx.config;

		let (uploads, upload_rx) = UploadQueue::channel();
		let (indexer, index_rx) = IndexerHandle::channel();
		let (changes, change_rx) = ChangeQueue::channel();

		match pending_versions(ctx.store.as_ref(), &profile.root_ids()) {
			Ok(pending) => {
				if !pending.is_empty() {
					info!("Re-queueing {} versions not yet uploaded", pending.len());
				}
				for version in pending {
					uploads.queue(version);
				}
			}
			Err(e) => warn!("Cannot look up pending uploads: {}", e),
		}

		let uploader = Arc::new(Uploader::new(ctx.clone(), profile.clone()));
		let index_worker = Arc::new(Indexer::new(ctx.clone(), profile.clone(), uploads.clone()));
		let change_manager = ChangeManager::new(ctx.clone(), profile.clone(), uploads.clone());
		let watcher = RemoteWatcher::new(ctx.clone(), profile.clone(), changes);

		let tasks = vec![
			tokio::spawn(uploader.run(upload_rx, cancel.child_token())),
			tokio::spawn(index_worker.run(index_rx, cancel.child_token(), config.tree_search_interval())),
			tokio::spawn(change_manager.run(change_rx, cancel.child_token(), config.apply_interval())),
			tokio::spawn(watcher.run(cancel.child_token(), config.sync_interval())),
		];

		info!("Profile {} started with {} folders", profile.name, profile.root_ids().len());
		ProfileRuntime { name: profile.name.clone(), cancel, indexer, tasks }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Where a filesystem watcher reports changes
	pub fn watch_listener(&self) -> Arc<dyn WatchListener> {
		Arc::new(self.indexer.clone())
	}

	/// Ask every worker to stop after its current item
	pub fn stop(&self) {
		info!("Stopping profile {}", self.name);
		self.cancel.cancel();
	}

	/// Wait for the workers to exit
	pub async fn join(self) {
		for task in self.tasks {
			if let Err(e) = task.await {
				error!("Worker of profile {} panicked: {}", self.name, e);
			}
		}
	}
}

// vim: ts=4
