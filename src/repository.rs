//! Repository descriptor
//!
//! The newest `repository-<timestamp>` file on the remote store describes
//! the repository: a format version and the remote ids of every folder
//! synchronized through it. Each machine merges the folders it knows into
//! the descriptor and republishes it when that changes the set.

use std::collections::BTreeSet;
use std::fs;

use crate::cache::ChunkCache;
use crate::codec::PayloadCodec;
use crate::error::RepositoryError;
use crate::logging::*;
use crate::metadata::now_millis;
use crate::remote::{RemoteName, StructuredFileList};
use crate::transfer::TransferManager;

/// Descriptor format understood by this build
pub const REPOSITORY_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
	remote_ids: BTreeSet<String>,
	/// Timestamp of the descriptor last read or written
	last_update: Option<i64>,
	changed: bool,
}

impl Repository {
	/// Descriptor for the given local folders, not yet read or committed
	pub fn new<I, S>(remote_ids: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Repository {
			remote_ids: remote_ids.into_iter().map(Into::into).collect(),
			last_update: None,
			changed: true,
		}
	}

	pub fn remote_ids(&self) -> &BTreeSet<String> {
		&self.remote_ids
	}

	pub fn is_changed(&self) -> bool {
		self.changed
	}

	pub fn last_update(&self) -> Option<i64> {
		self.last_update
	}

	/// Plain text payload: `key=value` lines
	pub fn to_text(&self) -> String {
		let ids: Vec<&str> = self.remote_ids.iter().map(String::as_str).collect();
		format!("version={}\nremoteIds={}\n", REPOSITORY_FORMAT_VERSION, ids.join(","))
	}

	/// Parse a payload, checking the format version; returns the remote ids
	pub fn parse_text(text: &str) -> Result<BTreeSet<String>, RepositoryError> {
		let mut version = None;
		let mut remote_ids = BTreeSet::new();
		for line in text.lines().map(str::trim) {
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let (key, value) = match line.split_once('=') {
				Some(kv) => kv,
				None => {
					return Err(RepositoryError::InvalidRepository { message: format!("bad line '{}'", line) })
				}
			};
			match key.trim() {
				"version" => version = Some(value.trim().to_string()),
				"remoteIds" => {
					remote_ids = value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
				}
				other => debug!("Ignoring repository key {}", other),
			}
		}

		match version {
			Some(v) if v == REPOSITORY_FORMAT_VERSION.to_string() => Ok(remote_ids),
			Some(v) => Err(RepositoryError::InvalidRepository {
				message: format!("unsupported version {}, expected {}", v, REPOSITORY_FORMAT_VERSION),
			}),
			None => Err(RepositoryError::InvalidRepository { message: "missing version".to_string() }),
		}
	}

	/// Merge remote ids read from a descriptor; local ids missing there mark the repository changed
	fn merge(&mut self, remote: BTreeSet<String>, timestamp: i64) {
		let missing: Vec<&String> = self.remote_ids.difference(&remote).collect();
		self.changed = !missing.is_empty();
		if self.changed {
			info!("Repository lacks folders {:?}, will republish", missing);
		}
		self.remote_ids.extend(remote);
		self.last_update = Some(timestamp);
	}

	/// Read the newest descriptor when it is newer than the last one seen.
	///
	/// Returns whether a descriptor was read.
	pub async fn update(
		&mut self,
		tm: &dyn TransferManager,
		cache: &ChunkCache,
		codec: &dyn PayloadCodec,
		list: &StructuredFileList,
	) -> Result<bool, RepositoryError> {
		let (timestamp, name) = list.newest_repository().ok_or(RepositoryError::NoRepositoryFound)?;
		if self.last_update.map_or(false, |last| last >= timestamp) {
			return Ok(false);
		}

		debug!("Reading repository descriptor {}", name);
		let temp = cache.temp_path("repository");
		let result = async {
			tm.download(name, &temp).await?;
			let packed = fs::read(&temp).map_err(|e| RepositoryError::Transfer(e.into()))?;
			let raw = codec
				.unpack(&packed)
				.map_err(|e| RepositoryError::InvalidRepository { message: e.to_string() })?;
			let text = String::from_utf8(raw)
				.map_err(|e| RepositoryError::InvalidRepository { message: e.to_string() })?;
			Repository::parse_text(&text)
		}
		.await;
		let _ = fs::remove_file(&temp);

		self.merge(result?, timestamp);
		Ok(true)
	}

	/// Publish the descriptor as `repository-<now>`.
	///
	/// With `create` set, refuses to write over an existing repository.
	pub async fn commit(
		&mut self,
		tm: &dyn TransferManager,
		cache: &ChunkCache,
		codec: &dyn PayloadCodec,
		create: bool,
	) -> Result<(), RepositoryError> {
		if create && !tm.list(Some("repository-")).await?.is_empty() {
			return Err(RepositoryError::AlreadyExists);
		}

		let timestamp = now_millis().max(self.last_update.map_or(0, |t| t + 1));
		let name = RemoteName::repository(timestamp);
		let temp = cache.temp_path("repository");
		let result = async {
			fs::write(&temp, codec.pack(self.to_text().as_bytes())).map_err(|e| RepositoryError::Transfer(e.into()))?;
			tm.upload(&temp, &name).await?;
			Ok::<(), RepositoryError>(())
		}
		.await;
		let _ = fs::remove_file(&temp);
		result?;

		info!("Published repository descriptor {} with folders {:?}", name, self.remote_ids);
		self.last_update = Some(timestamp);
		self.changed = false;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::Lz4Codec;
	use crate::transfer::LocalTransferManager;
	use tempfile::TempDir;

	#[test]
	fn test_text_format() {
		let repo = Repository::new(vec!["b", "a"]);
		assert_eq!(repo.to_text(), "version=1\nremoteIds=a,b\n");
		let ids = Repository::parse_text(&repo.to_text()).unwrap();
		assert_eq!(ids.len(), 2);
	}

	#[test]
	fn test_version_checks() {
		assert!(matches!(
			Repository::parse_text("remoteIds=a"),
			Err(RepositoryError::InvalidRepository { .. })
		));
		assert!(matches!(
			Repository::parse_text("version=2\nremoteIds=a"),
			Err(RepositoryError::InvalidRepository { .. })
		));
	}

	#[tokio::test]
	async fn test_commit_and_update() {
		let tmp = TempDir::new().unwrap();
		let tm = LocalTransferManager::new(&tmp.path().join("repo"));
		tm.connect().await.unwrap();
		let cache = ChunkCache::open(&tmp.path().join("cache")).unwrap();

		let list = StructuredFileList::new("alpha", &tm.list(None).await.unwrap());
		let mut other = Repository::new(vec!["docs"]);
		assert!(matches!(
			other.update(&tm, &cache, &Lz4Codec, &list).await,
			Err(RepositoryError::NoRepositoryFound)
		));

		let mut first = Repository::new(vec!["docs"]);
		first.commit(&tm, &cache, &Lz4Codec, true).await.unwrap();
		assert!(!first.is_changed());
		assert!(matches!(
			Repository::new(vec!["x"]).commit(&tm, &cache, &Lz4Codec, true).await,
			Err(RepositoryError::AlreadyExists)
		));

		let list = StructuredFileList::new("beta", &tm.list(None).await.unwrap());
		let mut second = Repository::new(vec!["docs", "photos"]);
		assert!(second.update(&tm, &cache, &Lz4Codec, &list).await.unwrap());
		assert!(second.is_changed());
		assert!(!second.update(&tm, &cache, &Lz4Codec, &list).await.unwrap());

		let mut same = Repository::new(vec!["docs"]);
		same.update(&tm, &cache, &Lz4Codec, &list).await.unwrap();
		assert!(!same.is_changed());
	}

	#[tokio::test]
	async fn test_wrong_codec_is_invalid() {
		let tmp = TempDir::new().unwrap();
		let tm = LocalTransferManager::new(&tmp.path().join("repo"));
		tm.connect().await.unwrap();
		let cache = ChunkCache::open(&tmp.path().join("cache")).unwrap();

		std::fs::write(tmp.path().join("repo/repository-5"), b"\x10\x00\x00\x00\xff\xff\xff").unwrap();
		let list = StructuredFileList::new("alpha", &tm.list(None).await.unwrap());
		let mut repo = Repository::new(vec!["docs"]);
		assert!(matches!(
			repo.update(&tm, &cache, &Lz4Codec, &list).await,
			Err(RepositoryError::InvalidRepository { .. })
		));
	}
}

// vim: ts=4
