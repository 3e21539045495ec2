//! # peersync - Peer-to-Peer Folder Synchronization
//!
//! peersync keeps folders on several machines in sync through a shared,
//! dumb remote store. There is no server: every machine publishes its
//! content-addressed chunks and its version history, and applies what the
//! others published, resolving conflicts the same way everywhere.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peersync::{Config, Context, ProfileRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("peersync.toml".as_ref())?;
//!     let ctx = Arc::new(Context::open(config)?);
//!     let profile = Arc::new(ctx.profile("default")?);
//!     let runtime = ProfileRuntime::start(ctx, profile);
//!     tokio::signal::ctrl_c().await?;
//!     runtime.stop();
//!     runtime.join().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Data flow
//!
//! - local changes: [`indexer`] → [`uploader`] → remote store
//! - remote changes: [`remote_watcher`] → [`dependency_queue`] → [`change_manager`] → local folder

pub mod cache;
pub mod callbacks;
pub mod change_manager;
pub mod chunking;
pub mod codec;
pub mod config;
pub mod context;
pub mod dependency_queue;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod metadata;
pub mod remote;
pub mod remote_watcher;
pub mod repository;
pub mod runtime;
pub mod transfer;
pub mod update;
pub mod uploader;
pub mod util;

// Re-export commonly used types and functions
pub use callbacks::{LoggingObserver, Notification, SyncObserver};
pub use chunking::{Chunk, Chunker};
pub use config::Config;
pub use context::{Context, Profile, Root};
pub use error::{ChunkError, RepositoryError, StoreError, SyncError, TransferError};
pub use metadata::{FileStatus, FileVersion, MetadataStore, RedbStore, SyncStatus};
pub use runtime::ProfileRuntime;
pub use update::Update;

// vim: ts=4
