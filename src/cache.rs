//! Local chunk cache
//!
//! Chunks live unpacked under `<cache>/chunk-<checksum>`. The cache is
//! shared by every profile while each repository may use its own codec, so
//! packing happens on the way to and from the remote store. Scratch files
//! for packed chunks, update logs and descriptors go to `<cache>/tmp`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::ChunkError;
use crate::logging::*;
use crate::metadata::chunk_remote_name;

/// Suffix of partially written cache files
const TEMP_SUFFIX: &str = ".peersync-tmp";

/// Content-addressed store of raw chunks shared by all profiles
#[derive(Debug, Clone)]
pub struct ChunkCache {
	dir: PathBuf,
}

impl ChunkCache {
	/// Open or create a cache directory
	pub fn open(dir: &Path) -> io::Result<Self> {
		fs::create_dir_all(dir.join("tmp"))?;
		Ok(ChunkCache { dir: dir.to_path_buf() })
	}

	pub fn chunk_path(&self, checksum: &str) -> PathBuf {
		self.dir.join(chunk_remote_name(checksum))
	}

	pub fn contains(&self, checksum: &str) -> bool {
		self.chunk_path(checksum).is_file()
	}

	/// Store a raw chunk. A chunk that is already present counts as stored.
	pub fn store(&self, checksum: &str, raw: &[u8]) -> Result<(), ChunkError> {
		let target = self.chunk_path(checksum);
		if target.is_file() {
			return Ok(());
		}

		let temp = self.temp_path(&chunk_remote_name(checksum));
		fs::write(&temp, raw)?;
		match fs::rename(&temp, &target) {
			Ok(()) => Ok(()),
			Err(_) if target.is_file() => {
				debug!("Chunk {} was cached concurrently", checksum);
				let _ = fs::remove_file(&temp);
				Ok(())
			}
			Err(e) => {
				let _ = fs::remove_file(&temp);
				Err(e.into())
			}
		}
	}

	pub fn read(&self, checksum: &str) -> Result<Vec<u8>, ChunkError> {
		match fs::read(self.chunk_path(checksum)) {
			Ok(bytes) => Ok(bytes),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				Err(ChunkError::Missing { checksum: checksum.to_string() })
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Unique scratch file path; the caller removes it when done
	pub fn temp_path(&self, prefix: &str) -> PathBuf {
		self.dir.join("tmp").join(format!("{}-{}{}", prefix, uuid::Uuid::new_v4(), TEMP_SUFFIX))
	}

	/// Remove scratch files left behind by an interrupted run
	pub fn cleanup_temp_files(&self) -> io::Result<usize> {
		let mut count = 0;
		for entry in fs::read_dir(self.dir.join("tmp"))? {
			let entry = match entry {
				Ok(e) => e,
				Err(e) => {
					debug!("Error reading cache entry during cleanup: {}", e);
					continue;
				}
			};
			let is_temp = entry.file_name().to_str().map_or(false, |n| n.ends_with(TEMP_SUFFIX));
			if !is_temp {
				continue;
			}
			match fs::remove_file(entry.path()) {
				Ok(()) => count += 1,
				Err(e) if e.kind() == io::ErrorKind::NotFound => {}
				Err(e) => warn!("Failed to remove temp file {:?}: {}", entry.path(), e),
			}
		}
		if count > 0 {
			info!("Removed {} orphaned cache temp files", count);
		}
		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_store_and_read() {
		let tmp = TempDir::new().unwrap();
		let cache = ChunkCache::open(tmp.path()).unwrap();

		assert!(!cache.contains("abc"));
		cache.store("abc", b"payload").unwrap();
		assert!(cache.contains("abc"));
		assert_eq!(cache.read("abc").unwrap(), b"payload");
		assert_eq!(cache.chunk_path("abc"), tmp.path().join("chunk-abc"));
	}

	#[test]
	fn test_chunks_are_kept_unpacked() {
		use crate::codec::{Lz4Codec, PayloadCodec, PlainCodec};

		let tmp = TempDir::new().unwrap();
		let cache = ChunkCache::open(tmp.path()).unwrap();
		let raw = b"shared between profiles with different codecs".repeat(4);

		// A chunk cached through one repository unpacks through another
		cache.store("abc", &Lz4Codec.unpack(&Lz4Codec.pack(&raw)).unwrap()).unwrap();
		assert_eq!(cache.read("abc").unwrap(), raw);
		assert_eq!(PlainCodec.unpack(&PlainCodec.pack(&cache.read("abc").unwrap())).unwrap(), raw);
	}

	#[test]
	fn test_existing_chunk_is_success() {
		let tmp = TempDir::new().unwrap();
		let cache = ChunkCache::open(tmp.path()).unwrap();

		cache.store("abc", b"first").unwrap();
		cache.store("abc", b"second").unwrap();
		assert_eq!(cache.read("abc").unwrap(), b"first");
	}

	#[test]
	fn test_missing_chunk() {
		let tmp = TempDir::new().unwrap();
		let cache = ChunkCache::open(tmp.path()).unwrap();

		match cache.read("nope") {
			Err(ChunkError::Missing { checksum }) => assert_eq!(checksum, "nope"),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn test_cleanup_temp_files() {
		let tmp = TempDir::new().unwrap();
		let cache = ChunkCache::open(tmp.path()).unwrap();

		fs::write(cache.temp_path("update-alpha"), b"partial").unwrap();
		fs::write(cache.temp_path("repository"), b"partial").unwrap();
		cache.store("abc", b"kept").unwrap();

		assert_eq!(cache.cleanup_temp_files().unwrap(), 2);
		assert!(cache.contains("abc"));
	}
}

// vim: ts=4
