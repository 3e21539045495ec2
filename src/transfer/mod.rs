//! Remote storage capability
//!
//! The sync engine only ever sees a [`TransferManager`]: a flat namespace of
//! files that can be listed, uploaded, downloaded and deleted. Backends are
//! selected by [`ConnectionConfig`] at configuration load.

mod local;

pub use local::LocalTransferManager;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::ConnectionConfig;
use crate::error::{TransferError, TransferResult};
use crate::logging::*;

/// Connection attempts before a cycle gives up
pub const CONNECT_ATTEMPTS: usize = 3;

/// Delay before the first reconnect, doubled on every further attempt
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Entry of a remote listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
	pub name: String,
	pub size: u64,
}

/// Flat remote file store
#[async_trait]
pub trait TransferManager: Send + Sync {
	/// Human readable location, for logs
	fn location(&self) -> String;

	async fn connect(&self) -> TransferResult<()>;

	async fn disconnect(&self) -> TransferResult<()>;

	/// Files whose name starts with `prefix`, or every file
	async fn list(&self, prefix: Option<&str>) -> TransferResult<BTreeMap<String, RemoteFile>>;

	/// Copy a local file to `remote_name`, replacing it if present
	async fn upload(&self, local: &Path, remote_name: &str) -> TransferResult<()>;

	/// Copy `remote_name` into a local file
	async fn download(&self, remote_name: &str, local: &Path) -> TransferResult<()>;

	async fn delete(&self, remote_name: &str) -> TransferResult<()>;
}

/// Backend shared by the workers of one profile.
///
/// Connections are counted: the backend connects on the first `connect` and
/// disconnects once every `connect` was matched by a `disconnect`, so one
/// worker finishing never cuts off another.
pub struct SharedTransfer {
	inner: Arc<dyn TransferManager>,
	users: Mutex<usize>,
}

impl SharedTransfer {
	pub fn new(inner: Arc<dyn TransferManager>) -> Self {
		SharedTransfer { inner, users: Mutex::new(0) }
	}

	/// Workers currently connected
	pub async fn users(&self) -> usize {
		*self.users.lock().await
	}
}

#[async_trait]
impl TransferManager for SharedTransfer {
	fn location(&self) -> String {
		self.inner.location()
	}

	async fn connect(&self) -> TransferResult<()> {
		let mut users = self.users.lock().await;
		if *users == 0 {
			self.inner.connect().await?;
			trace!("Connected to {}", self.inner.location());
		}
		*users += 1;
		Ok(())
	}

	async fn disconnect(&self) -> TransferResult<()> {
		let mut users = self.users.lock().await;
		match *users {
			0 => Ok(()),
			1 => {
				*users = 0;
				trace!("Disconnecting from {}", self.inner.location());
				self.inner.disconnect().await
			}
			_ => {
				*users -= 1;
				Ok(())
			}
		}
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

/// Build the backend named by a connection config
pub fn transfer_manager_for(config: &ConnectionConfig) -> Arc<dyn TransferManager> {
	match config {
		ConnectionConfig::Local { path } => Arc::new(LocalTransferManager::new(path)),
	}
}

/// Connect with a bounded number of attempts and exponential backoff
pub async fn connect_with_retry(
	tm: &dyn TransferManager,
	attempts: usize,
	backoff: Duration,
) -> TransferResult<()> {
	let mut delay = backoff;
	let mut last_error = None;
	for attempt in 1..=attempts.max(1) {
		match tm.connect().await {
			Ok(()) => {
				if attempt > 1 {
					info!("Connected to {} after {} attempts", tm.location(), attempt);
				}
				return Ok(());
			}
			Err(e) if e.is_connectivity() => {
				debug!("Connecting to {} failed (attempt {}/{}): {}", tm.location(), attempt, attempts, e);
				last_error = Some(e);
				if attempt < attempts {
					tokio::time::sleep(delay).await;
					delay *= 2;
				}
			}
			Err(e) => return Err(e),
		}
	}
	Err(last_error.unwrap_or_else(|| TransferError::ConnectFailed {
		location: tm.location(),
		message: "no attempts made".to_string(),
	}))
}


// vim: ts=4
