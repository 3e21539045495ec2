mod common;

use common::{repository, Machine, ROOT_ID};
use peersync::ProfileRuntime;
use std::time::Duration;

#[tokio::test]
async fn test_watch_events_reach_the_indexer() {
	let repo = repository().await;
	let m = Machine::new("alpha", repo.path());
	let runtime = ProfileRuntime::start(m.ctx.clone(), m.profile.clone());
	assert_eq!(runtime.name(), "test");

	let path = m.write("watched.txt", "reported by the watcher");
	runtime.watch_listener().on_created_or_modified(ROOT_ID, &path);

	let mut indexed = None;
	for _ in 0..100 {
		indexed = m.latest_at("watched.txt");
		if indexed.is_some() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert!(indexed.is_some());

	runtime.stop();
	runtime.join().await;
}

// vim: ts=4
