//! Content chunking
//!
//! Splits a byte stream into content-addressed chunks. Two boundary
//! policies are available:
//!
//! - fixed-size blocks of exactly `chunk_size` bytes (last one shorter)
//! - two-threshold, two-divisor (TTTD) content-defined chunking driven by a
//!   pluggable rolling hash
//!
//! Every chunk carries the blake3 digest of its raw bytes; the final chunk
//! also carries the digest of the whole stream.

use rollsum::{Bup, Engine};
use std::fmt;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::config::ChunkerKind;

/// Size of the reads issued against the underlying stream
const READ_BUFFER: usize = 64 * 1024;

/// Chunk bits handed to the Bup engine (unused by TTTD, which has its own divisors)
const BUP_CHUNK_BITS: u32 = 13;

/// One piece of a chunked stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
	/// Position of the chunk in the stream, starting at 0
	pub number: usize,
	/// Lowercase hex blake3 digest of `contents`
	pub checksum: String,
	pub contents: Vec<u8>,
	/// Digest of the entire stream; only set on the final chunk
	pub file_checksum: Option<String>,
}

impl Chunk {
	pub fn len(&self) -> usize {
		self.contents.len()
	}

	pub fn is_empty(&self) -> bool {
		self.contents.is_empty()
	}

	pub fn is_last(&self) -> bool {
		self.file_checksum.is_some()
	}
}

/// Content checksum used for chunk ids and whole-file checksums
pub fn checksum(data: &[u8]) -> String {
	blake3::hash(data).to_hex().to_string()
}

// ============================================================================
// ROLLING HASHES
// ============================================================================

/// Rolling hash driving content-defined boundaries
pub trait RollingHash: Send {
	/// Forget all state; called at the start of every chunk
	fn reset(&mut self);

	fn roll_byte(&mut self, byte: u8);

	fn digest(&self) -> u32;
}

/// bupsplit rolling checksum over a 64 byte window
pub struct BupHash(Bup);

impl Default for BupHash {
	fn default() -> Self {
		BupHash(Bup::new_with_chunk_bits(BUP_CHUNK_BITS))
	}
}

impl RollingHash for BupHash {
	fn reset(&mut self) {
		self.0 = Bup::new_with_chunk_bits(BUP_CHUNK_BITS);
	}

	fn roll_byte(&mut self, byte: u8) {
		self.0.roll_byte(byte);
	}

	fn digest(&self) -> u32 {
		self.0.digest()
	}
}

/// Uses only the most recent byte as the hash value.
///
/// Reproduces the boundary behavior of older clients; it has no window,
/// so it does not resynchronize after insertions.
#[derive(Default)]
pub struct LastByte(u8);

impl RollingHash for LastByte {
	fn reset(&mut self) {
		self.0 = 0;
	}

	fn roll_byte(&mut self, byte: u8) {
		self.0 = byte;
	}

	fn digest(&self) -> u32 {
		self.0 as u32
	}
}

/// Factory for the default rolling hash
pub fn bup_hash() -> Box<dyn RollingHash> {
	Box::new(BupHash::default())
}

/// Factory for the single-byte legacy hash
pub fn last_byte_hash() -> Box<dyn RollingHash> {
	Box::new(LastByte::default())
}

// ============================================================================
// CHUNKER
// ============================================================================

/// Thresholds of the two-threshold, two-divisor algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TttdParams {
	/// Minimum chunk length
	pub tmin: usize,
	/// Maximum chunk length
	pub tmax: usize,
	/// Main divisor
	pub divisor: u32,
	/// Backup divisor, used when no main boundary is found before `tmax`
	pub backup_divisor: u32,
}

impl TttdParams {
	/// Thresholds for an expected chunk size of roughly `chunk_size`
	pub fn for_chunk_size(chunk_size: usize) -> Self {
		let chunk_size = chunk_size.max(4);
		TttdParams {
			tmin: chunk_size / 2,
			tmax: chunk_size * 2,
			divisor: (chunk_size / 2).max(2) as u32,
			backup_divisor: (chunk_size / 4).max(2) as u32,
		}
	}
}

#[derive(Clone, Copy)]
enum Mode {
	Fixed { chunk_size: usize },
	Tttd { params: TttdParams, hash: fn() -> Box<dyn RollingHash> },
}

/// Chunking configuration; cheap to clone and share between workers
#[derive(Clone, Copy)]
pub struct Chunker {
	mode: Mode,
}

impl fmt::Debug for Chunker {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.mode {
			Mode::Fixed { chunk_size } => write!(f, "Chunker::Fixed({})", chunk_size),
			Mode::Tttd { params, .. } => write!(f, "Chunker::Tttd({:?})", params),
		}
	}
}

impl Chunker {
	pub fn fixed(chunk_size: usize) -> Self {
		Chunker { mode: Mode::Fixed { chunk_size: chunk_size.max(1) } }
	}

	/// Content-defined chunking with the bupsplit rolling hash
	pub fn tttd(params: TttdParams) -> Self {
		Self::tttd_with_hash(params, bup_hash)
	}

	/// Content-defined chunking with a caller supplied rolling hash
	pub fn tttd_with_hash(params: TttdParams, hash: fn() -> Box<dyn RollingHash>) -> Self {
		let params = TttdParams {
			tmin: params.tmin.max(1),
			tmax: params.tmax.max(params.tmin.max(1)),
			divisor: params.divisor.max(1),
			backup_divisor: params.backup_divisor.max(1),
		};
		Chunker { mode: Mode::Tttd { params, hash } }
	}

	pub fn from_config(kind: ChunkerKind, chunk_size: usize) -> Self {
		match kind {
			ChunkerKind::Fixed => Self::fixed(chunk_size),
			ChunkerKind::Tttd => Self::tttd(TttdParams::for_chunk_size(chunk_size)),
		}
	}

	/// Lazily chunk a stream. Each call starts from the reader's current position.
	pub fn chunks<R: Read>(&self, reader: R) -> ChunkStream<R> {
		let boundary = match self.mode {
			Mode::Fixed { chunk_size } => Boundary::Fixed(chunk_size),
			Mode::Tttd { params, hash } => Boundary::Tttd { params, hash: hash() },
		};
		ChunkStream {
			reader,
			boundary,
			pending: Vec::new(),
			eof: false,
			done: false,
			number: 0,
			file_hasher: blake3::Hasher::new(),
		}
	}

	pub fn chunk_file(&self, path: &Path) -> io::Result<ChunkStream<BufReader<fs::File>>> {
		let file = fs::File::open(path)?;
		Ok(self.chunks(BufReader::new(file)))
	}
}

enum Boundary {
	Fixed(usize),
	Tttd { params: TttdParams, hash: Box<dyn RollingHash> },
}

impl Boundary {
	fn max_len(&self) -> usize {
		match self {
			Boundary::Fixed(size) => *size,
			Boundary::Tttd { params, .. } => params.tmax,
		}
	}

	/// Length of the next chunk at the start of `data`
	fn cut(&mut self, data: &[u8]) -> usize {
		match self {
			Boundary::Fixed(size) => data.len().min(*size),
			Boundary::Tttd { params, hash } => tttd_cut(params, hash.as_mut(), data),
		}
	}
}

fn tttd_cut(params: &TttdParams, hash: &mut dyn RollingHash, data: &[u8]) -> usize {
	hash.reset();
	let limit = data.len().min(params.tmax);
	let mut backup = 0;

	for (i, &byte) in data[..limit].iter().enumerate() {
		hash.roll_byte(byte);
		let len = i + 1;
		if len < params.tmin {
			continue;
		}

		let digest = hash.digest();
		if digest % params.backup_divisor == params.backup_divisor - 1 {
			backup = len;
		}
		if digest % params.divisor == params.divisor - 1 {
			return len;
		}
	}

	if data.len() < params.tmax {
		// end of stream before either threshold
		data.len()
	} else if backup > 0 {
		backup
	} else {
		params.tmax
	}
}

/// Lazy iterator over the chunks of one stream.
///
/// Chunks yielded before an I/O error are complete and usable.
pub struct ChunkStream<R> {
	reader: R,
	boundary: Boundary,
	pending: Vec<u8>,
	eof: bool,
	done: bool,
	number: usize,
	file_hasher: blake3::Hasher,
}

impl<R: Read> ChunkStream<R> {
	fn fill(&mut self, want: usize) -> io::Result<()> {
		let mut buf = vec![0u8; READ_BUFFER];
		while !self.eof && self.pending.len() < want {
			match self.reader.read(&mut buf) {
				Ok(0) => self.eof = true,
				Ok(n) => self.pending.extend_from_slice(&buf[..n]),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}

	fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
		// One byte past the longest chunk tells whether this chunk is the last
		let want = self.boundary.max_len() + 1;
		self.fill(want)?;

		if self.pending.is_empty() && self.number > 0 {
			return Ok(None);
		}

		let len = self.boundary.cut(&self.pending);
		let contents: Vec<u8> = self.pending.drain(..len).collect();
		self.file_hasher.update(&contents);

		let last = self.eof && self.pending.is_empty();
		let file_checksum =
			if last { Some(self.file_hasher.finalize().to_hex().to_string()) } else { None };

		let chunk = Chunk { number: self.number, checksum: checksum(&contents), contents, file_checksum };
		self.number += 1;
		if last {
			self.done = true;
		}
		Ok(Some(chunk))
	}
}

impl<R: Read> Iterator for ChunkStream<R> {
	type Item = io::Result<Chunk>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}
		match self.next_chunk() {
			Ok(Some(chunk)) => Some(Ok(chunk)),
			Ok(None) => {
				self.done = true;
				None
			}
			Err(e) => {
				self.done = true;
				Some(Err(e))
			}
		}
	}
}


// vim: ts=4
