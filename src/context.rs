//! Process context and profiles
//!
//! A [`Context`] bundles what every worker needs: configuration, machine
//! name, metadata store and chunk cache. A [`Profile`] adds what is specific
//! to one repository: its roots, chunker, codec and transfer backend. Both
//! are passed explicitly to the components that use them.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::ChunkCache;
use crate::callbacks::{NoObserver, SyncObserver};
use crate::chunking::Chunker;
use crate::codec::{codec_for, PayloadCodec};
use crate::config::{Config, ProfileConfig};
use crate::error::SyncError;
use crate::metadata::{MetadataStore, RedbStore};
use crate::transfer::{transfer_manager_for, SharedTransfer, TransferManager};

/// Shared process-wide state
pub struct Context {
	pub config: Config,
	pub machine_name: String,
	pub store: Arc<dyn MetadataStore>,
	pub cache: ChunkCache,
	pub observer: Arc<dyn SyncObserver>,
	/// Paths the change manager is writing right now
	pub busy: BusyPaths,
}

impl Context {
	/// Open the metadata store and chunk cache under the configured data directory
	pub fn open(config: Config) -> Result<Context, SyncError> {
		std::fs::create_dir_all(&config.data_dir)?;
		let store = RedbStore::open(&config.database_path())?;
		let cache = ChunkCache::open(&config.cache_dir())?;
		cache.cleanup_temp_files()?;
		Ok(Context::with_store(config, Arc::new(store), cache))
	}

	pub fn with_store(config: Config, store: Arc<dyn MetadataStore>, cache: ChunkCache) -> Context {
		Context {
			machine_name: config.machine_name.clone(),
			config,
			store,
			cache,
			observer: Arc::new(NoObserver),
			busy: BusyPaths::default(),
		}
	}

	pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Context {
		self.observer = observer;
		self
	}

	/// Build a profile by name
	pub fn profile(&self, name: &str) -> Result<Profile, SyncError> {
		let config = self
			.config
			.profile(name)
			.ok_or_else(|| SyncError::UnknownProfile { name: name.to_string() })?;
		Ok(Profile::from_config(config))
	}
}

/// Paths claimed by a writer. The indexer leaves them alone until the claim
/// is dropped, so half-applied changes are never indexed as local edits.
#[derive(Debug, Default)]
pub struct BusyPaths {
	paths: Mutex<HashSet<PathBuf>>,
}

impl BusyPaths {
	fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
		match self.paths.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		}
	}

	/// Claim `paths` until the returned guard is dropped
	pub fn claim<I>(&self, paths: I) -> BusyClaim<'_>
	where
		I: IntoIterator<Item = PathBuf>,
	{
		let mut set = self.lock();
		let claimed: Vec<PathBuf> = paths.into_iter().filter(|p| set.insert(p.clone())).collect();
		BusyClaim { owner: self, paths: claimed }
	}

	/// Whether `path` or one of its ancestors is claimed
	pub fn contains(&self, path: &Path) -> bool {
		let set = self.lock();
		path.ancestors().any(|p| set.contains(p))
	}
}

pub struct BusyClaim<'a> {
	owner: &'a BusyPaths,
	paths: Vec<PathBuf>,
}

impl Drop for BusyClaim<'_> {
	fn drop(&mut self) {
		let mut set = self.owner.lock();
		for path in &self.paths {
			set.remove(path);
		}
	}
}

/// A local folder synchronized under a repository-wide id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
	pub remote_id: String,
	pub local_path: PathBuf,
}

/// One repository and the folders synchronized through it
pub struct Profile {
	pub name: String,
	roots: BTreeMap<String, Root>,
	pub chunker: Chunker,
	pub codec: Arc<dyn PayloadCodec>,
	/// Connection-counted backend shared by the profile's workers
	pub transfer: Arc<dyn TransferManager>,
}

impl Profile {
	pub fn from_config(config: &ProfileConfig) -> Profile {
		let repo = &config.repository;
		Profile::new(
			&config.name,
			config.folders.iter().map(|f| Root { remote_id: f.remote_id.clone(), local_path: f.local_path.clone() }),
			Chunker::from_config(repo.chunker, repo.chunk_size),
			Arc::from(codec_for(repo.compression)),
			transfer_manager_for(&repo.connection),
		)
	}

	pub fn new<I>(
		name: &str,
		roots: I,
		chunker: Chunker,
		codec: Arc<dyn PayloadCodec>,
		transfer: Arc<dyn TransferManager>,
	) -> Profile
	where
		I: IntoIterator<Item = Root>,
	{
		Profile {
			name: name.to_string(),
			roots: roots.into_iter().map(|r| (r.remote_id.clone(), r)).collect(),
			chunker,
			codec,
			transfer: Arc::new(SharedTransfer::new(transfer)),
		}
	}

	pub fn root(&self, remote_id: &str) -> Option<&Root> {
		self.roots.get(remote_id)
	}

	pub fn roots(&self) -> impl Iterator<Item = &Root> {
		self.roots.values()
	}

	pub fn root_ids(&self) -> Vec<String> {
		self.roots.keys().cloned().collect()
	}

	/// Root containing an absolute path
	pub fn root_for_path(&self, path: &Path) -> Option<&Root> {
		self.roots.values().find(|r| path.starts_with(&r.local_path))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{FolderConfig, ProfileConfig};

	#[test]
	fn test_profile_roots() {
		let config = ProfileConfig {
			name: "work".to_string(),
			folders: vec![
				FolderConfig { remote_id: "docs".to_string(), local_path: PathBuf::from("/home/u/Docs") },
				FolderConfig { remote_id: "pics".to_string(), local_path: PathBuf::from("/home/u/Pics") },
			],
			..ProfileConfig::default()
		};
		let profile = Profile::from_config(&config);

		assert_eq!(profile.root_ids(), vec!["docs".to_string(), "pics".to_string()]);
		assert_eq!(profile.root("pics").unwrap().local_path, PathBuf::from("/home/u/Pics"));
		assert_eq!(profile.root_for_path(Path::new("/home/u/Docs/a/b")).unwrap().remote_id, "docs");
		assert!(profile.root_for_path(Path::new("/tmp/x")).is_none());
	}

	#[test]
	fn test_busy_paths() {
		let busy = BusyPaths::default();
		{
			let _claim = busy.claim(vec![PathBuf::from("/r/a.txt"), PathBuf::from("/r/dir")]);
			assert!(busy.contains(Path::new("/r/a.txt")));
			assert!(busy.contains(Path::new("/r/dir/inner.txt")));
			assert!(!busy.contains(Path::new("/r/b.txt")));

			// A nested claim of the same path does not release it early
			drop(busy.claim(vec![PathBuf::from("/r/a.txt")]));
			assert!(busy.contains(Path::new("/r/a.txt")));
		}
		assert!(!busy.contains(Path::new("/r/a.txt")));
		assert!(!busy.contains(Path::new("/r/dir")));
	}
}

// vim: ts=4
