//! Pack/unpack of payloads stored on the remote side
//!
//! Chunks, update logs and repository descriptors all go through the
//! same codec so that a repository is readable only with matching settings.

use crate::config::Compression;
use crate::error::ChunkError;

/// Reversible transformation applied to every remote payload
pub trait PayloadCodec: Send + Sync {
	fn pack(&self, raw: &[u8]) -> Vec<u8>;

	fn unpack(&self, packed: &[u8]) -> Result<Vec<u8>, ChunkError>;
}

/// Stores payloads as they are
pub struct PlainCodec;

impl PayloadCodec for PlainCodec {
	fn pack(&self, raw: &[u8]) -> Vec<u8> {
		raw.to_vec()
	}

	fn unpack(&self, packed: &[u8]) -> Result<Vec<u8>, ChunkError> {
		Ok(packed.to_vec())
	}
}

/// LZ4 block compression with the uncompressed size prepended
pub struct Lz4Codec;

impl PayloadCodec for Lz4Codec {
	fn pack(&self, raw: &[u8]) -> Vec<u8> {
		lz4_flex::compress_prepend_size(raw)
	}

	fn unpack(&self, packed: &[u8]) -> Result<Vec<u8>, ChunkError> {
		lz4_flex::decompress_size_prepended(packed)
			.map_err(|e| ChunkError::Unpack { message: e.to_string() })
	}
}

pub fn codec_for(compression: Compression) -> Box<dyn PayloadCodec> {
	match compression {
		Compression::None => Box::new(PlainCodec),
		Compression::Lz4 => Box::new(Lz4Codec),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lz4_shrinks_repetitive_data() {
		let raw = b"the same line over and over\n".repeat(200);
		let codec = codec_for(Compression::Lz4);
		let packed = codec.pack(&raw);
		assert!(packed.len() < raw.len());
		assert_eq!(codec.unpack(&packed).unwrap(), raw);
	}

	#[test]
	fn test_lz4_rejects_garbage() {
		let codec = Lz4Codec;
		assert!(codec.unpack(&[0x10, 0, 0, 0, 0xff, 0xff, 0xff]).is_err());
	}
}

// vim: ts=4
