mod common;

use common::{repository, Machine, ROOT_ID};
use peersync::chunking::checksum;
use peersync::codec::{Lz4Codec, PayloadCodec, PlainCodec};
use peersync::indexer::IndexOutcome;
use peersync::transfer::LocalTransferManager;
use peersync::uploader::Uploader;
use peersync::{Chunker, FileStatus, Profile, Root, SyncStatus};
use std::fs;
use std::sync::Arc;

#[tokio::test]
async fn test_file_id_survives_change_rename_and_move() {
	let repo = repository().await;
	let m = Machine::new("alpha", repo.path());
	let indexer = m.indexer();
	let root = m.root_def();

	let path = m.write("a.txt", "hello");
	let first = match indexer.check(root, &path).unwrap() {
		IndexOutcome::New(v) => v,
		other => panic!("expected a new file, got {:?}", other),
	};

	// Content change
	fs::write(&path, "hello, world").unwrap();
	let changed = match indexer.check(root, &path).unwrap() {
		IndexOutcome::Changed(v) => v,
		other => panic!("expected a change, got {:?}", other),
	};
	assert_eq!(changed.file_id, first.file_id);
	assert_eq!(changed.version, 2);

	// Same size and mtime within tolerance is a no-op
	assert_eq!(indexer.check(root, &path).unwrap(), IndexOutcome::Unchanged);

	// Move into a folder
	fs::create_dir(m.root.join("sub")).unwrap();
	let moved = m.root.join("sub").join("b.txt");
	fs::rename(&path, &moved).unwrap();
	assert_eq!(indexer.move_path(root, &path, &moved).unwrap(), IndexOutcome::Moved(1));
	let after_move = m.latest_at("sub/b.txt").unwrap();
	assert_eq!(after_move.file_id, first.file_id);
	assert_eq!(after_move.status, FileStatus::Renamed);
	assert_eq!(after_move.parent.as_ref().unwrap().file_id, m.latest_at("sub").unwrap().file_id);

	// Only delete and recreate gives a new id
	fs::remove_file(&moved).unwrap();
	assert_eq!(indexer.delete(root, &moved).unwrap(), IndexOutcome::Deleted(1));
	fs::write(&moved, "a different text").unwrap();
	match indexer.check(root, &moved).unwrap() {
		IndexOutcome::New(v) => assert_ne!(v.file_id, first.file_id),
		other => panic!("expected a new file, got {:?}", other),
	}
}

#[tokio::test]
async fn test_rename_detected_by_checksum() {
	let repo = repository().await;
	let m = Machine::new("alpha", repo.path());
	let indexer = m.indexer();
	let root = m.root_def();

	let old = m.write("report.txt", "quarterly numbers");
	let original = match indexer.check(root, &old).unwrap() {
		IndexOutcome::New(v) => v,
		other => panic!("unexpected {:?}", other),
	};

	// The watcher reports the new name before the old one vanishes
	let new = m.root.join("report2.txt");
	fs::rename(&old, &new).unwrap();
	match indexer.check(root, &new).unwrap() {
		IndexOutcome::Renamed(v) => {
			assert_eq!(v.file_id, original.file_id);
			assert_eq!(v.chunks, original.chunks);
			assert_eq!(v.name, "report2.txt");
		}
		other => panic!("expected a rename, got {:?}", other),
	}
	// Nothing left to delete at the old path
	assert_eq!(indexer.delete(root, &old).unwrap(), IndexOutcome::Skipped);

	// A far away name with the same content is a new file
	let far = m.write("archive/2023/copies/of/reports.txt", "quarterly numbers");
	fs::remove_file(&new).unwrap();
	match indexer.check(root, &far).unwrap() {
		IndexOutcome::New(v) => assert_ne!(v.file_id, original.file_id),
		other => panic!("expected a new file, got {:?}", other),
	}
}

#[tokio::test]
async fn test_deleting_folder_deletes_descendants() {
	let repo = repository().await;
	let mut m = Machine::new("alpha", repo.path());
	m.write("dir/a.txt", "a");
	m.write("dir/sub/b.txt", "b");
	m.write("dir/sub/deeper/c.txt", "c");
	m.write("keep.txt", "k");
	m.index();
	m.upload().await;

	fs::remove_dir_all(m.root.join("dir")).unwrap();
	let outcome = m.indexer().delete(m.root_def(), &m.root.join("dir")).unwrap();
	// dir, a.txt, sub, b.txt, deeper, c.txt
	assert_eq!(outcome, IndexOutcome::Deleted(6));

	let history = m.ctx.store.get_history(&[common::ROOT_ID.to_string()]).unwrap();
	let deleted: Vec<_> = history.iter().filter(|v| v.status == FileStatus::Deleted).collect();
	assert_eq!(deleted.len(), 6);
	assert!(deleted.iter().all(|v| v.version == 2));
	assert!(m.latest_at("keep.txt").is_some());
	assert!(m.latest_at("dir/sub/b.txt").is_none());

	let queued = m.upload().await;
	assert_eq!(queued.len(), 6);
	assert!(queued.iter().all(|o| o.uploaded_chunks == 0));
}

#[tokio::test]
async fn test_scan_marks_vanished_files_and_removes_leftovers() {
	let repo = repository().await;
	let m = Machine::new("alpha", repo.path());
	let indexer = m.indexer();
	let root = m.root_def();

	m.write("x/one.txt", "1");
	m.write("two.txt", "2");
	let stats = indexer.scan_root(root, true).unwrap();
	assert_eq!(stats.checked, 3);
	assert_eq!(stats.changed, 3);

	fs::remove_dir_all(m.root.join("x")).unwrap();
	m.write(".ignore-assemble-to-two.txt", "partial");
	m.write(".ignore-private/notes.txt", "not synced");

	// Periodic scans leave ignored entries alone
	let stats = indexer.scan_root(root, false).unwrap();
	assert_eq!(stats.deleted, 2);
	assert_eq!(stats.removed_ignored, 0);
	assert!(m.root.join(".ignore-private").exists());

	let stats = indexer.scan_root(root, true).unwrap();
	assert_eq!(stats.removed_ignored, 2);
	assert_eq!(m.names(), vec!["two.txt".to_string()]);
	assert!(m.latest_at(".ignore-private/notes.txt").is_none());
}

#[tokio::test]
async fn test_mtime_only_change_creates_version() {
	let repo = repository().await;
	let m = Machine::new("alpha", repo.path());
	let indexer = m.indexer();
	let root = m.root_def();

	let path = m.write("t.txt", "same");
	indexer.check(root, &path).unwrap();
	let v1 = m.latest_at("t.txt").unwrap();

	peersync::util::set_mtime_millis(&path, v1.last_modified + 300).unwrap();
	assert_eq!(indexer.check(root, &path).unwrap(), IndexOutcome::Unchanged);

	peersync::util::set_mtime_millis(&path, v1.last_modified + 60_000).unwrap();
	match indexer.check(root, &path).unwrap() {
		IndexOutcome::Changed(v) => {
			assert_eq!(v.checksum, v1.checksum);
			assert_eq!(v.sync_status, SyncStatus::Local);
		}
		other => panic!("expected a change, got {:?}", other),
	}
}

#[tokio::test]
async fn test_existing_chunks_are_not_uploaded_again() {
	let repo = repository().await;
	let mut m = Machine::new("alpha", repo.path());
	m.write("one.txt", "duplicated payload");
	m.index();
	let first = m.upload().await;
	assert_eq!(first.iter().map(|o| o.uploaded_chunks).sum::<usize>(), 5);

	// Same content under another name: every chunk is already remote
	m.write("two.txt", "duplicated payload");
	m.index();
	let second = m.upload().await;
	assert_eq!(second.len(), 1);
	assert_eq!(second[0].uploaded_chunks, 0);
	assert_eq!(second[0].skipped_chunks, 5);
	assert_eq!(m.latest_at("two.txt").unwrap().sync_status, SyncStatus::UpToDate);
}

#[tokio::test]
async fn test_each_repository_gets_chunks_packed_with_its_codec() {
	let lz4_repo = repository().await;
	let plain_repo = repository().await;
	let mut m = Machine::with("alpha", Arc::new(Lz4Codec), Arc::new(LocalTransferManager::new(lz4_repo.path())));
	m.write("a.txt", "abcdefgh");
	m.index();
	m.upload().await;

	// Second profile over the same folder and cache, different repository and codec
	let plain = Arc::new(Profile::new(
		"plain",
		vec![Root { remote_id: ROOT_ID.to_string(), local_path: m.root.clone() }],
		Chunker::fixed(4),
		Arc::new(PlainCodec),
		Arc::new(LocalTransferManager::new(plain_repo.path())),
	));
	let outcome = Uploader::new(m.ctx.clone(), plain).process(&m.latest_at("a.txt").unwrap()).await.unwrap();
	assert_eq!(outcome.uploaded_chunks, 2);

	let name = format!("chunk-{}", checksum(b"abcd"));
	let packed = fs::read(lz4_repo.path().join(&name)).unwrap();
	assert_eq!(Lz4Codec.unpack(&packed).unwrap(), b"abcd".to_vec());
	assert_eq!(fs::read(plain_repo.path().join(&name)).unwrap(), b"abcd".to_vec());
	assert_eq!(m.ctx.cache.read(&checksum(b"efgh")).unwrap(), b"efgh".to_vec());
}

#[tokio::test]
async fn test_scan_leaves_paths_being_written_alone() {
	let repo = repository().await;
	let m = Machine::new("alpha", repo.path());
	let indexer = m.indexer();
	let root = m.root_def();

	let old = m.write("old.txt", "indexed before");
	indexer.check(root, &old).unwrap();

	let claim = m.ctx.busy.claim(vec![old.clone(), m.root.join("incoming")]);
	fs::remove_file(&old).unwrap();
	let new = m.write("incoming/new.txt", "half written");
	let stats = indexer.scan_root(root, false).unwrap();
	assert_eq!(stats.deleted, 0);
	assert!(m.latest_at("old.txt").is_some());
	assert!(m.latest_at("incoming/new.txt").is_none());
	assert_eq!(indexer.check(root, &new).unwrap(), IndexOutcome::Skipped);

	drop(claim);
	let stats = indexer.scan_root(root, false).unwrap();
	assert_eq!(stats.deleted, 1);
	assert!(m.latest_at("old.txt").is_none());
	assert!(m.latest_at("incoming/new.txt").is_some());
}

// vim: ts=4
