//! Error types for peersync operations

use std::error::Error;
use std::fmt;
use std::io;

/// Main error type for sync operations
#[derive(Debug)]
pub enum SyncError {
	/// I/O error
	Io(io::Error),

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Unknown profile or root
	UnknownProfile { name: String },

	/// Metadata store error (nested)
	Store(StoreError),

	/// Transfer error (nested)
	Transfer(TransferError),

	/// Chunk error (nested)
	Chunk(ChunkError),

	/// Repository error (nested)
	Repository(RepositoryError),

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::UnknownProfile { name } => write!(f, "Unknown profile: {}", name),
			SyncError::Store(e) => write!(f, "Store error: {}", e),
			SyncError::Transfer(e) => write!(f, "Transfer error: {}", e),
			SyncError::Chunk(e) => write!(f, "Chunk error: {}", e),
			SyncError::Repository(e) => write!(f, "Repository error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		SyncError::Store(e)
	}
}

impl From<TransferError> for SyncError {
	fn from(e: TransferError) -> Self {
		SyncError::Transfer(e)
	}
}

impl From<ChunkError> for SyncError {
	fn from(e: ChunkError) -> Self {
		SyncError::Chunk(e)
	}
}

impl From<RepositoryError> for SyncError {
	fn from(e: RepositoryError) -> Self {
		SyncError::Repository(e)
	}
}

impl SyncError {
	/// Another worker appended to the same history first
	pub fn is_version_race(&self) -> bool {
		matches!(self, SyncError::Store(StoreError::VersionExists { .. }))
	}
}

impl From<UpdateParseError> for SyncError {
	fn from(e: UpdateParseError) -> Self {
		SyncError::Other { message: e.to_string() }
	}
}

/// Metadata store errors
#[derive(Debug)]
pub enum StoreError {
	/// Underlying database failure
	Database { source: redb::Error },

	/// Stored value could not be (de)serialized
	Serialization { message: String },

	/// Referenced version does not exist
	NotFound { file_id: u64, version: u32 },

	/// Retries exhausted while creating a shared record
	Contention { what: String },

	/// A version with this key, or a later one, was saved first
	VersionExists { file_id: u64, version: u32 },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::Database { source } => write!(f, "Database error: {}", source),
			StoreError::Serialization { message } => {
				write!(f, "Serialization error: {}", message)
			}
			StoreError::NotFound { file_id, version } => {
				write!(f, "Version {} of file {} not found", version, file_id)
			}
			StoreError::Contention { what } => write!(f, "Gave up creating {}", what),
			StoreError::VersionExists { file_id, version } => {
				write!(f, "Version {} of file {} already exists", version, file_id)
			}
		}
	}
}

impl Error for StoreError {}

impl From<redb::Error> for StoreError {
	fn from(e: redb::Error) -> Self {
		StoreError::Database { source: e }
	}
}

impl From<redb::DatabaseError> for StoreError {
	fn from(e: redb::DatabaseError) -> Self {
		StoreError::Database { source: e.into() }
	}
}

impl From<redb::TransactionError> for StoreError {
	fn from(e: redb::TransactionError) -> Self {
		StoreError::Database { source: e.into() }
	}
}

impl From<redb::TableError> for StoreError {
	fn from(e: redb::TableError) -> Self {
		StoreError::Database { source: e.into() }
	}
}

impl From<redb::StorageError> for StoreError {
	fn from(e: redb::StorageError) -> Self {
		StoreError::Database { source: e.into() }
	}
}

impl From<redb::CommitError> for StoreError {
	fn from(e: redb::CommitError) -> Self {
		StoreError::Database { source: e.into() }
	}
}

impl From<json5::Error> for StoreError {
	fn from(e: json5::Error) -> Self {
		StoreError::Serialization { message: e.to_string() }
	}
}

impl From<std::str::Utf8Error> for StoreError {
	fn from(e: std::str::Utf8Error) -> Self {
		StoreError::Serialization { message: e.to_string() }
	}
}

/// Remote storage errors
#[derive(Debug)]
pub enum TransferError {
	/// Backend unreachable or refused the connection
	ConnectFailed { location: String, message: String },

	/// Remote file does not exist
	NotFound { name: String },

	/// Local or remote I/O failure
	Io(io::Error),

	/// Anything else the backend reports
	Other { message: String },
}

impl TransferError {
	/// Whether the failure is worth retrying on the next cycle
	pub fn is_connectivity(&self) -> bool {
		matches!(self, TransferError::ConnectFailed { .. } | TransferError::Io(_))
	}
}

impl fmt::Display for TransferError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransferError::ConnectFailed { location, message } => {
				write!(f, "Failed to connect to {}: {}", location, message)
			}
			TransferError::NotFound { name } => write!(f, "Remote file not found: {}", name),
			TransferError::Io(e) => write!(f, "I/O error: {}", e),
			TransferError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for TransferError {}

impl From<io::Error> for TransferError {
	fn from(e: io::Error) -> Self {
		TransferError::Io(e)
	}
}

/// Chunking and chunk cache errors
#[derive(Debug)]
pub enum ChunkError {
	/// Failed to read or write chunk data
	Io { source: io::Error },

	/// Packed payload could not be unpacked
	Unpack { message: String },

	/// Chunk is neither cached nor available remotely
	Missing { checksum: String },
}

impl fmt::Display for ChunkError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChunkError::Io { source } => write!(f, "Chunk I/O failed: {}", source),
			ChunkError::Unpack { message } => write!(f, "Cannot unpack payload: {}", message),
			ChunkError::Missing { checksum } => write!(f, "Chunk {} is missing", checksum),
		}
	}
}

impl Error for ChunkError {}

impl From<io::Error> for ChunkError {
	fn from(e: io::Error) -> Self {
		ChunkError::Io { source: e }
	}
}

/// Repository descriptor errors
#[derive(Debug)]
pub enum RepositoryError {
	/// No repository-* file on the remote store
	NoRepositoryFound,

	/// Descriptor failed the version or integrity checks
	InvalidRepository { message: String },

	/// Tried to initialize over an existing repository
	AlreadyExists,

	/// Remote access failed
	Transfer(TransferError),
}

impl fmt::Display for RepositoryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RepositoryError::NoRepositoryFound => write!(f, "No repository-* file found"),
			RepositoryError::InvalidRepository { message } => {
				write!(f, "Invalid repository: {}", message)
			}
			RepositoryError::AlreadyExists => write!(f, "Repository already initialized"),
			RepositoryError::Transfer(e) => write!(f, "{}", e),
		}
	}
}

impl Error for RepositoryError {}

impl From<TransferError> for RepositoryError {
	fn from(e: TransferError) -> Self {
		RepositoryError::Transfer(e)
	}
}

/// A single unparseable row of an update log
#[derive(Debug)]
pub struct UpdateParseError {
	pub line: u64,
	pub message: String,
}

impl fmt::Display for UpdateParseError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Update row {}: {}", self.line, self.message)
	}
}

impl Error for UpdateParseError {}

/// Result type for metadata store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for remote storage operations
pub type TransferResult<T> = Result<T, TransferError>;

// vim: ts=4
