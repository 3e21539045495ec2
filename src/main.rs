use clap::{Arg, Command};
use std::error::Error;
use std::sync::Arc;
use std::{env, path};

use chrono::TimeZone;
use peersync::change_manager::{ChangeManager, ChangeQueue};
use peersync::indexer::Indexer;
use peersync::logging::*;
use peersync::remote_watcher::RemoteWatcher;
use peersync::repository::Repository;
use peersync::transfer::{connect_with_retry, CONNECT_ATTEMPTS, CONNECT_BACKOFF};
use peersync::uploader::{pending_versions, UploadQueue, Uploader};
use peersync::util::relative_to;
use peersync::{Config, Context, FileVersion, LoggingObserver, Profile, ProfileRuntime};

///////////////////////
// Utility functions //
///////////////////////

fn default_config_path() -> path::PathBuf {
	Config::default().data_dir.join("config.toml")
}

fn load_config(matches: &clap::ArgMatches) -> Result<Config, Box<dyn Error>> {
	let config_path = matches
		.get_one::<String>("config")
		.map(path::PathBuf::from)
		.unwrap_or_else(default_config_path);
	if !config_path.exists() {
		return Err(format!("Config file {} not found", config_path.display()).into());
	}
	Ok(Config::load(&config_path)?)
}

fn open_profile(ctx: &Context, matches: &clap::ArgMatches) -> Result<Arc<Profile>, Box<dyn Error>> {
	let name = matches.get_one::<String>("profile").ok_or("profile argument required")?;
	Ok(Arc::new(ctx.profile(name)?))
}

/// Drain an upload queue whose senders have all been dropped
async fn upload_all(
	ctx: Arc<Context>,
	profile: Arc<Profile>,
	mut rx: tokio::sync::mpsc::UnboundedReceiver<FileVersion>,
) -> Result<usize, Box<dyn Error>> {
	let uploader = Uploader::new(ctx, profile);
	let mut count = 0;
	while let Some(version) = rx.recv().await {
		uploader.process(&version).await?;
		count += 1;
	}
	Ok(count)
}

fn format_millis(millis: i64) -> String {
	match chrono::Local.timestamp_millis_opt(millis).single() {
		Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
		None => millis.to_string(),
	}
}

//////////////
// Commands //
//////////////

async fn init(ctx: Arc<Context>, profile: Arc<Profile>) -> Result<(), Box<dyn Error>> {
	let tm = profile.transfer.clone();
	connect_with_retry(tm.as_ref(), CONNECT_ATTEMPTS, CONNECT_BACKOFF).await?;
	let mut repository = Repository::new(profile.root_ids());
	let result = repository.commit(tm.as_ref(), &ctx.cache, profile.codec.as_ref(), true).await;
	tm.disconnect().await?;
	result?;
	println!("Initialized repository at {} with folders {:?}", tm.location(), repository.remote_ids());
	Ok(())
}

async fn run(ctx: Arc<Context>) -> Result<(), Box<dyn Error>> {
	let runtimes: Vec<ProfileRuntime> = ctx
		.config
		.profiles
		.iter()
		.filter(|p| p.enabled)
		.map(|p| ProfileRuntime::start(ctx.clone(), Arc::new(Profile::from_config(p))))
		.collect();
	if runtimes.is_empty() {
		return Err("No enabled profiles".into());
	}

	tokio::signal::ctrl_c().await?;
	info!("Interrupted, shutting down");
	for runtime in &runtimes {
		runtime.stop();
	}
	for runtime in runtimes {
		runtime.join().await;
	}
	Ok(())
}

async fn index(ctx: Arc<Context>, profile: Arc<Profile>) -> Result<(), Box<dyn Error>> {
	let (uploads, rx) = UploadQueue::channel();
	for version in pending_versions(ctx.store.as_ref(), &profile.root_ids())? {
		uploads.queue(version);
	}

	let indexer = Indexer::new(ctx.clone(), profile.clone(), uploads);
	let scan_profile = profile.clone();
	let stats = tokio::task::spawn_blocking(move || {
		let mut stats = Vec::new();
		for root in scan_profile.roots() {
			stats.push((root.local_path.clone(), indexer.scan_root(root, true)?));
		}
		Ok::<_, peersync::SyncError>(stats)
	})
	.await??;

	for (path, s) in stats {
		println!("{}: {} checked, {} changed, {} deleted", path.display(), s.checked, s.changed, s.deleted);
	}
	let uploaded = upload_all(ctx, profile, rx).await?;
	println!("{} versions uploaded", uploaded);
	Ok(())
}

async fn sync(ctx: Arc<Context>, profile: Arc<Profile>) -> Result<(), Box<dyn Error>> {
	let (changes, mut change_rx) = ChangeQueue::channel();
	let mut watcher = RemoteWatcher::new(ctx.clone(), profile.clone(), changes);
	let report = watcher.sync_cycle().await?;
	println!("{} update files read, {} updates to apply", report.update_files, report.updates_queued);

	let (uploads, upload_rx) = UploadQueue::channel();
	let mut manager = ChangeManager::new(ctx.clone(), profile.clone(), uploads);
	while let Ok(batch) = change_rx.try_recv() {
		let summary = manager.apply_batch(batch).await;
		println!(
			"{} applied, {} conflicts, {} skipped, {} deferred",
			summary.applied, summary.conflicts, summary.skipped, summary.deferred
		);
		if let Some(n) = summary.notification {
			println!("{}: {}", n.title, n.body);
		}
	}
	drop(manager);

	let uploaded = upload_all(ctx, profile, upload_rx).await?;
	if uploaded > 0 {
		println!("{} versions uploaded", uploaded);
	}
	Ok(())
}

fn history(ctx: &Context, profile: &Profile, file: &str) -> Result<(), Box<dyn Error>> {
	let target = path::Path::new(file);
	let target = if target.is_absolute() { target.to_path_buf() } else { env::current_dir()?.join(target) };
	let root = profile.root_for_path(&target).ok_or_else(|| format!("{} is not in a synchronized folder", file))?;
	let relative = relative_to(&root.local_path, &target).ok_or("path is a synchronized folder itself")?;

	let file_id = ctx
		.store
		.get_history(&[root.remote_id.clone()])?
		.into_iter()
		.rev()
		.find(|v| v.relative_path() == relative)
		.map(|v| v.file_id)
		.ok_or_else(|| format!("{} has no history", relative))?;

	for v in ctx.store.get_versions(file_id)? {
		println!(
			"v{:<4} {:<8} {:<9} {}  {:<12} {:>10}  {}",
			v.version,
			v.status.to_string(),
			format!("{:?}", v.sync_status),
			format_millis(v.updated),
			v.client_name,
			v.size,
			v.relative_path()
		);
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let profile_arg = || Arg::new("profile").required(true).help("Profile name");
	let matches = Command::new("peersync")
		.version("0.1.0")
		.about("Peer-to-peer folder synchronization")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("CONFIG")
				.help("Configuration file (TOML or JSON5)"),
		)
		.subcommand(Command::new("init").about("Create the repository of a profile").arg(profile_arg()))
		.subcommand(Command::new("run").about("Synchronize all enabled profiles until interrupted"))
		.subcommand(Command::new("index").about("Index the folders of a profile and upload").arg(profile_arg()))
		.subcommand(Command::new("sync").about("Run a single synchronization cycle").arg(profile_arg()))
		.subcommand(
			Command::new("history")
				.about("Show the version history of a file")
				.arg(profile_arg())
				.arg(Arg::new("path").required(true)),
		)
		.get_matches();

	let config = load_config(&matches)?;
	init_tracing(&config.log_level);
	let ctx = Arc::new(Context::open(config)?.with_observer(Arc::new(LoggingObserver)));

	if let Some(sub_matches) = matches.subcommand_matches("init") {
		init(ctx.clone(), open_profile(&ctx, sub_matches)?).await?;
	} else if matches.subcommand_matches("run").is_some() {
		run(ctx).await?;
	} else if let Some(sub_matches) = matches.subcommand_matches("index") {
		index(ctx.clone(), open_profile(&ctx, sub_matches)?).await?;
	} else if let Some(sub_matches) = matches.subcommand_matches("sync") {
		sync(ctx.clone(), open_profile(&ctx, sub_matches)?).await?;
	} else if let Some(sub_matches) = matches.subcommand_matches("history") {
		let profile = open_profile(&ctx, sub_matches)?;
		let file = sub_matches.get_one::<String>("path").ok_or("history: path argument required")?;
		history(&ctx, &profile, file)?;
	}

	Ok(())
}

// vim: ts=4
