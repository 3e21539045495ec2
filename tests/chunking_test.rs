use peersync::chunking::{checksum, Chunker, TttdParams};
use std::fs;
use std::io::Write;
use tempfile::TempDir;

const MIB_QUARTER: usize = 256 * 1024;

/// Pseudo-random but reproducible content
fn content(len: usize) -> Vec<u8> {
	let mut state: u32 = 0x1234_5678;
	(0..len)
		.map(|_| {
			state ^= state << 13;
			state ^= state >> 17;
			state ^= state << 5;
			(state & 0xff) as u8
		})
		.collect()
}

#[test]
fn test_fixed_chunking_of_large_file() {
	let temp_dir = TempDir::new().unwrap();
	let path = temp_dir.path().join("large.bin");
	let data = content(10_000_000);
	fs::File::create(&path).unwrap().write_all(&data).unwrap();

	let chunks: Vec<_> = Chunker::fixed(MIB_QUARTER).chunk_file(&path).unwrap().map(|c| c.unwrap()).collect();

	assert_eq!(chunks.len(), 39);
	assert!(chunks[..38].iter().all(|c| c.len() == MIB_QUARTER));
	assert_eq!(chunks[38].len(), 38528);

	// Only the last chunk carries the whole-file checksum
	assert!(chunks[..38].iter().all(|c| c.file_checksum.is_none()));
	assert_eq!(chunks[38].file_checksum.as_deref(), Some(checksum(&data).as_str()));

	let joined: Vec<u8> = chunks.iter().flat_map(|c| c.contents.iter().copied()).collect();
	assert_eq!(joined, data);
	for (i, c) in chunks.iter().enumerate() {
		assert_eq!(c.number, i);
		assert_eq!(c.checksum, checksum(&c.contents));
	}
}

#[test]
fn test_same_file_same_chunks() {
	let temp_dir = TempDir::new().unwrap();
	let path = temp_dir.path().join("data.bin");
	fs::write(&path, content(300_000)).unwrap();

	let chunker = Chunker::tttd(TttdParams::for_chunk_size(8192));
	let ids = |p: &std::path::Path| -> Vec<String> {
		chunker.chunk_file(p).unwrap().map(|c| c.unwrap().checksum).collect()
	};
	let first = ids(&path);
	assert!(first.len() > 1);
	assert_eq!(first, ids(&path));

	// A copy elsewhere chunks identically
	let copy = temp_dir.path().join("copy.bin");
	fs::copy(&path, &copy).unwrap();
	assert_eq!(first, ids(&copy));
}

#[test]
fn test_prepended_bytes_keep_most_chunks() {
	let data = content(500_000);
	let mut shifted = b"a short header".to_vec();
	shifted.extend_from_slice(&data);

	let chunker = Chunker::tttd(TttdParams::for_chunk_size(8192));
	let before: Vec<String> = chunker.chunks(&data[..]).map(|c| c.unwrap().checksum).collect();
	let after: Vec<String> = chunker.chunks(&shifted[..]).map(|c| c.unwrap().checksum).collect();

	let shared = after.iter().filter(|c| before.contains(c)).count();
	assert!(shared * 2 > after.len(), "only {} of {} chunks survived", shared, after.len());

	// Fixed-size chunking has no such luck
	let fixed = Chunker::fixed(8192);
	let before: Vec<String> = fixed.chunks(&data[..]).map(|c| c.unwrap().checksum).collect();
	let after: Vec<String> = fixed.chunks(&shifted[..]).map(|c| c.unwrap().checksum).collect();
	assert_eq!(after.iter().filter(|c| before.contains(c)).count(), 0);
}

#[test]
fn test_missing_file() {
	let temp_dir = TempDir::new().unwrap();
	assert!(Chunker::fixed(16).chunk_file(&temp_dir.path().join("nope")).is_err());
}

// vim: ts=4
