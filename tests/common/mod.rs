//! Shared fixtures: machines with their own data directory and synchronized
//! folder, talking to one repository directory.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use peersync::change_manager::{ApplySummary, ChangeManager, ChangeQueue, UpdateBatch};
use peersync::chunking::Chunker;
use peersync::codec::{PayloadCodec, PlainCodec};
use peersync::context::{Context, Profile, Root};
use peersync::error::TransferResult;
use peersync::indexer::Indexer;
use peersync::remote_watcher::{CycleReport, RemoteWatcher};
use peersync::repository::Repository;
use peersync::transfer::{LocalTransferManager, RemoteFile, TransferManager};
use peersync::uploader::{UploadOutcome, UploadQueue, Uploader};
use peersync::{Config, FileVersion, Update};

pub const ROOT_ID: &str = "docs";

pub struct Machine {
	_dir: TempDir,
	pub ctx: Arc<Context>,
	pub profile: Arc<Profile>,
	pub root: PathBuf,
	watcher: RemoteWatcher,
	changes: tokio::sync::mpsc::UnboundedReceiver<UpdateBatch>,
	manager: ChangeManager,
	uploads: UploadQueue,
	upload_rx: tokio::sync::mpsc::UnboundedReceiver<FileVersion>,
}

impl Machine {
	pub fn new(name: &str, repo: &Path) -> Machine {
		Machine::with(name, Arc::new(PlainCodec), Arc::new(LocalTransferManager::new(repo)))
	}

	pub fn with(name: &str, codec: Arc<dyn PayloadCodec>, transfer: Arc<dyn TransferManager>) -> Machine {
		let dir = TempDir::new().unwrap();
		let mut config = Config::default();
		config.machine_name = name.to_string();
		config.user_name = format!("user of {}", name);
		config.data_dir = dir.path().join("data");
		let ctx = Arc::new(Context::open(config).unwrap());

		let root = dir.path().join("docs");
		fs::create_dir_all(&root).unwrap();
		let profile = Arc::new(Profile::new(
			"test",
			vec![Root { remote_id: ROOT_ID.to_string(), local_path: root.clone() }],
			Chunker::fixed(4),
			codec,
			transfer,
		));

		let (uploads, upload_rx) = UploadQueue::channel();
		let (change_queue, changes) = ChangeQueue::channel();
		let watcher = RemoteWatcher::new(ctx.clone(), profile.clone(), change_queue);
		let manager = ChangeManager::new(ctx.clone(), profile.clone(), uploads.clone());
		Machine { _dir: dir, ctx, profile, root, watcher, changes, manager, uploads, upload_rx }
	}

	pub fn root_def(&self) -> &Root {
		self.profile.root(ROOT_ID).unwrap()
	}

	pub fn indexer(&self) -> Indexer {
		Indexer::new(self.ctx.clone(), self.profile.clone(), self.uploads.clone())
	}

	pub fn write(&self, relative: &str, content: &str) -> PathBuf {
		let path = self.root.join(relative);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(&path, content).unwrap();
		path
	}

	pub fn read(&self, relative: &str) -> String {
		fs::read_to_string(self.root.join(relative)).unwrap()
	}

	/// Names directly inside the synchronized folder, sorted
	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> =
			fs::read_dir(&self.root).unwrap().map(|e| e.unwrap().file_name().to_string_lossy().to_string()).collect();
		names.sort();
		names
	}

	pub fn index(&self) {
		self.indexer().scan_root(self.root_def(), false).unwrap();
	}

	/// Process everything queued for upload so far
	pub async fn upload(&mut self) -> Vec<UploadOutcome> {
		let uploader = Uploader::new(self.ctx.clone(), self.profile.clone());
		let mut outcomes = Vec::new();
		while let Ok(version) = self.upload_rx.try_recv() {
			outcomes.push(uploader.process(&version).await.unwrap());
		}
		outcomes
	}

	/// Index, upload, run one cycle, apply what came in and upload the results
	pub async fn sync(&mut self) -> (CycleReport, ApplySummary) {
		self.index();
		self.upload().await;
		let report = self.watcher.sync_cycle().await.unwrap();
		let mut batch = UpdateBatch::default();
		while let Ok(received) = self.changes.try_recv() {
			batch.updates.extend(received.updates);
			batch.sources.extend(received.sources);
		}
		let summary: ApplySummary = self.manager.apply_batch(batch).await;
		self.upload().await;
		(report, summary)
	}

	/// Run one cycle and throw away what it queued, as if the process stopped before applying
	pub async fn fetch_and_stop(&mut self) -> CycleReport {
		let report = self.watcher.sync_cycle().await.unwrap();
		while self.changes.try_recv().is_ok() {}
		self.restart();
		report
	}

	/// Fresh workers on the same data directory
	pub fn restart(&mut self) {
		let (change_queue, changes) = ChangeQueue::channel();
		self.watcher = RemoteWatcher::new(self.ctx.clone(), self.profile.clone(), change_queue);
		self.changes = changes;
		self.manager = ChangeManager::new(self.ctx.clone(), self.profile.clone(), self.uploads.clone());
	}

	/// Apply updates directly, without a sync cycle
	pub async fn apply(&mut self, updates: Vec<Update>) -> ApplySummary {
		self.manager.apply_updates(updates).await
	}

	pub fn latest_at(&self, relative: &str) -> Option<FileVersion> {
		let (path, name) = peersync::metadata::split_relative(relative);
		self.ctx.store.find_by_path(ROOT_ID, &path, &name, None).unwrap()
	}
}

/// Local backend that counts how many connections are left open
pub struct CountingTransfer {
	inner: LocalTransferManager,
	open: AtomicIsize,
}

impl CountingTransfer {
	pub fn new(repo: &Path) -> Arc<CountingTransfer> {
		Arc::new(CountingTransfer { inner: LocalTransferManager::new(repo), open: AtomicIsize::new(0) })
	}

	pub fn open_connections(&self) -> isize {
		self.open.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl TransferManager for CountingTransfer {
	fn location(&self) -> String {
		self.inner.location()
	}

	async fn connect(&self) -> TransferResult<()> {
		self.inner.connect().await?;
		self.open.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn disconnect(&self) -> TransferResult<()> {
		self.open.fetch_sub(1, Ordering::SeqCst);
		self.inner.disconnect().await
	}

	async fn list(&self, prefix: Option<&str>) -> TransferResult<BTreeMap<String, RemoteFile>> {
		self.inner.list(prefix).await
	}

	async fn upload(&self, local: &Path, remote_name: &str) -> TransferResult<()> {
		self.inner.upload(local, remote_name).await
	}

	async fn download(&self, remote_name: &str, local: &Path) -> TransferResult<()> {
		self.inner.download(remote_name, local).await
	}

	async fn delete(&self, remote_name: &str) -> TransferResult<()> {
		self.inner.delete(remote_name).await
	}
}

/// A repository directory with its descriptor already published
pub async fn repository() -> TempDir {
	let dir = TempDir::new().unwrap();
	let tm = LocalTransferManager::new(dir.path());
	let cache_dir = TempDir::new().unwrap();
	let cache = peersync::cache::ChunkCache::open(cache_dir.path()).unwrap();
	Repository::new(vec![ROOT_ID]).commit(&tm, &cache, &PlainCodec, true).await.unwrap();
	dir
}

// vim: ts=4
