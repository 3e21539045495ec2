//! Transfer backend for a directory on a mounted filesystem

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{RemoteFile, TransferManager};
use crate::error::{TransferError, TransferResult};
use crate::logging::*;

/// Prefix of partially uploaded files; never listed
const PARTIAL_PREFIX: &str = ".partial-";

pub struct LocalTransferManager {
	root: PathBuf,
}

impl LocalTransferManager {
	pub fn new(root: &Path) -> Self {
		LocalTransferManager { root: root.to_path_buf() }
	}

	fn remote_path(&self, remote_name: &str) -> TransferResult<PathBuf> {
		if remote_name.is_empty() || remote_name.contains('/') || remote_name.contains('\\') || remote_name.starts_with('.') {
			return Err(TransferError::Other { message: format!("Invalid remote name: {:?}", remote_name) });
		}
		Ok(self.root.join(remote_name))
	}
}

fn not_found_or(e: io::Error, remote_name: &str) -> TransferError {
	if e.kind() == io::ErrorKind::NotFound {
		TransferError::NotFound { name: remote_name.to_string() }
	} else {
		TransferError::Io(e)
	}
}

#[async_trait]
impl TransferManager for LocalTransferManager {
	fn location(&self) -> String {
		format!("local:{}", self.root.display())
	}

	async fn connect(&self) -> TransferResult<()> {
		fs::create_dir_all(&self.root).await.map_err(|e| TransferError::ConnectFailed {
			location: self.location(),
			message: e.to_string(),
		})?;
		let meta = fs::metadata(&self.root).await.map_err(|e| TransferError::ConnectFailed {
			location: self.location(),
			message: e.to_string(),
		})?;
		if !meta.is_dir() {
			return Err(TransferError::ConnectFailed {
				location: self.location(),
				message: "not a directory".to_string(),
			});
		}
		Ok(())
	}

	async fn disconnect(&self) -> TransferResult<()> {
		Ok(())
	}

	async fn list(&self, prefix: Option<&str>) -> TransferResult<BTreeMap<String, RemoteFile>> {
		let mut result = BTreeMap::new();
		let mut entries = fs::read_dir(&self.root).await?;
		while let Some(entry) = entries.next_entry().await? {
			let name = match entry.file_name().into_string() {
				Ok(n) => n,
				Err(_) => continue,
			};
			if name.starts_with('.') || prefix.map_or(false, |p| !name.starts_with(p)) {
				continue;
			}
			let meta = match entry.metadata().await {
				Ok(m) if m.is_file() => m,
				Ok(_) => continue,
				Err(e) => {
					debug!("Skipping remote entry {}: {}", name, e);
					continue;
				}
			};
			result.insert(name.clone(), RemoteFile { name, size: meta.len() });
		}
		Ok(result)
	}

	async fn upload(&self, local: &Path, remote_name: &str) -> TransferResult<()> {
		let target = self.remote_path(remote_name)?;
		let partial = self.root.join(format!("{}{}", PARTIAL_PREFIX, uuid::Uuid::new_v4()));
		if let Err(e) = fs::copy(local, &partial).await {
			let _ = fs::remove_file(&partial).await;
			return Err(e.into());
		}
		if let Err(e) = fs::rename(&partial, &target).await {
			let _ = fs::remove_file(&partial).await;
			return Err(e.into());
		}
		trace!("Uploaded {:?} as {}", local, remote_name);
		Ok(())
	}

	async fn download(&self, remote_name: &str, local: &Path) -> TransferResult<()> {
		let source = self.remote_path(remote_name)?;
		fs::copy(&source, local).await.map_err(|e| not_found_or(e, remote_name))?;
		trace!("Downloaded {} to {:?}", remote_name, local);
		Ok(())
	}

	async fn delete(&self, remote_name: &str) -> TransferResult<()> {
		let target = self.remote_path(remote_name)?;
		fs::remove_file(&target).await.map_err(|e| not_found_or(e, remote_name))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_upload_list_download_delete() {
		let tmp = TempDir::new().unwrap();
		let tm = LocalTransferManager::new(&tmp.path().join("repo"));
		tm.connect().await.unwrap();

		let local = tmp.path().join("payload");
		std::fs::write(&local, b"hello").unwrap();
		tm.upload(&local, "chunk-aa").await.unwrap();
		tm.upload(&local, "update-alpha-1").await.unwrap();

		let all = tm.list(None).await.unwrap();
		assert_eq!(all.len(), 2);
		assert_eq!(all["chunk-aa"].size, 5);
		assert_eq!(tm.list(Some("chunk-")).await.unwrap().len(), 1);

		let back = tmp.path().join("back");
		tm.download("chunk-aa", &back).await.unwrap();
		assert_eq!(std::fs::read(&back).unwrap(), b"hello");

		tm.delete("chunk-aa").await.unwrap();
		match tm.download("chunk-aa", &back).await {
			Err(TransferError::NotFound { name }) => assert_eq!(name, "chunk-aa"),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_rejects_path_names() {
		let tmp = TempDir::new().unwrap();
		let tm = LocalTransferManager::new(tmp.path());
		assert!(tm.delete("../escape").await.is_err());
	}
}

// vim: ts=4
