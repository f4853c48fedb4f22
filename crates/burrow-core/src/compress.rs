use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};

const TAG_STORE: u8 = 0x00;
const TAG_ZSTD: u8 = 0x01;

/// Maximum decompressed size for a single blob or payload file (1 GiB).
/// Prevents a corrupted header from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 1 << 30;

/// Compression mode of a backup. Selects which pool its blobs live in and
/// how payload files are encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CompressMode {
    #[default]
    None,
    Zstd,
}

impl CompressMode {
    pub fn as_tag(self) -> u8 {
        match self {
            CompressMode::None => TAG_STORE,
            CompressMode::Zstd => TAG_ZSTD,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_STORE => Ok(CompressMode::None),
            TAG_ZSTD => Ok(CompressMode::Zstd),
            other => Err(BurrowError::UnknownCompressionTag(other)),
        }
    }

    /// Pool directory name for this mode.
    pub fn pool_name(self) -> &'static str {
        match self {
            CompressMode::None => "pool",
            CompressMode::Zstd => "cpool",
        }
    }
}

/// Encode a payload with a 1-byte codec tag prepended.
pub fn encode(mode: CompressMode, data: &[u8]) -> Result<Vec<u8>> {
    match mode {
        CompressMode::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_STORE);
            out.extend_from_slice(data);
            Ok(out)
        }
        CompressMode::Zstd => {
            let compressed = zstd::bulk::compress(data, 0)
                .map_err(|e| BurrowError::Other(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decode a tagged payload back into plain bytes.
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(BurrowError::Decompression("empty payload".into()));
    }
    match data[0] {
        TAG_STORE => Ok(data[1..].to_vec()),
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(&data[1..]))
                .map_err(|e| BurrowError::Decompression(format!("zstd init: {e}")))?;
            let mut out = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut out)
                .map_err(|e| BurrowError::Decompression(format!("zstd: {e}")))?;
            if out.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(BurrowError::Decompression(format!(
                    "decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(out)
        }
        other => Err(BurrowError::UnknownCompressionTag(other)),
    }
}

/// Write `data` to `path` in the tagged on-disk format.
pub fn write_file(path: &Path, mode: CompressMode, data: &[u8]) -> Result<()> {
    let encoded = encode(mode, data)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encoded)?;
    Ok(())
}

/// Read and decode a tagged payload file. A zero-length file decodes to
/// empty content.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path)?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    decode(&raw)
}
