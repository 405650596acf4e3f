//! Persistent index file: fixed binary schema, little-endian, magic +
//! version header. The reader's regular-file and compressed-file modes
//! both depend on reading one for pre-filtering, so this module ships a
//! real reader/writer rather than an in-memory-only summary.

use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::block::flags;
use crate::model::{BlockIndex, LineCounts, TimestampRange};

/// `b"LMIDX1\0\0"` — eight bytes, checked before anything else is read.
pub const VALID_MAGIC: u64 = 0x4C_4D_49_44_58_31_00_00;
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error reading index: {0}")]
    Io(#[from] std::io::Error),

    #[error("index frame decode error: {0}")]
    Decode(#[from] bincode::Error),

    #[error("bad magic: expected 0x{VALID_MAGIC:016x}, found 0x{found:016x}")]
    BadMagic { found: u64 },

    #[error("unsupported index version {found}, this build supports {CURRENT_VERSION}")]
    UnsupportedVersion { found: u32 },

    #[error("source file changed since index was built: expected sha256 {expected}, found {found}")]
    Stale { expected: String, found: String },

    #[error("block index flags 0x{flags:016x} set reserved bits outside the defined mask")]
    ReservedFlagBits { flags: u64 },
}

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Index {
    pub flags: u64,
    pub lines: (u64, u64),
    pub timestamps: (bool, Timestamp, Timestamp),
}

impl From<BlockIndex> for Index {
    fn from(b: BlockIndex) -> Self {
        Self {
            flags: b.flags,
            lines: (b.lines.valid, b.lines.invalid),
            timestamps: (b.timestamps.present, b.timestamps.min, b.timestamps.max),
        }
    }
}

impl Index {
    pub fn to_block_index(&self) -> Result<BlockIndex, IndexError> {
        BlockIndex::validate_flags(self.flags).map_err(|_| IndexError::ReservedFlagBits { flags: self.flags })?;
        Ok(BlockIndex {
            flags: self.flags,
            lines: LineCounts {
                valid: self.lines.0,
                invalid: self.lines.1,
            },
            timestamps: TimestampRange {
                present: self.timestamps.0,
                min: self.timestamps.1,
                max: self.timestamps.2,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceBlock {
    pub offset: u64,
    pub size: u64,
    pub index: Index,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFile {
    pub size: u64,
    pub sha256: [u8; 32],
    pub path: String,
    pub modified: Timestamp,
    pub index: Index,
    pub blocks: Vec<SourceBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Root {
    pub source: SourceFile,
}

/// sha256 over the full source file, used both to build `SourceFile.sha256`
/// and to validate an index against a source before trusting it.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Write `root` to `writer` as `magic(8 LE) || version(4 LE) ||
/// bincode(root)`.
pub fn write_index<W: Write>(writer: &mut W, root: &Root) -> Result<(), IndexError> {
    writer.write_all(&VALID_MAGIC.to_le_bytes())?;
    writer.write_all(&CURRENT_VERSION.to_le_bytes())?;
    let body = bincode::serialize(root)?;
    writer.write_all(&body)?;
    Ok(())
}

/// Read and validate an index frame. Rejects a bad magic, an unsupported
/// version, and (via `Index::to_block_index`, transitively) any block whose
/// flags carry bits outside `flags::DEFINED_MASK` — readers must reject
/// frames with unknown flag bits set outside the reserved ranges.
/// `flagSorted` is treated as authoritative: there is no legacy
/// `flagUnsorted` schema to special-case, a version-1 frame with `Sorted`
/// unset simply means "not known to be sorted".
pub fn read_index<R: Read>(reader: &mut R) -> Result<Root, IndexError> {
    let mut magic_bytes = [0u8; 8];
    reader.read_exact(&mut magic_bytes)?;
    let magic = u64::from_le_bytes(magic_bytes);
    if magic != VALID_MAGIC {
        return Err(IndexError::BadMagic { found: magic });
    }

    let mut version_bytes = [0u8; 4];
    reader.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);
    if version != CURRENT_VERSION {
        return Err(IndexError::UnsupportedVersion { found: version });
    }

    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    let root: Root = bincode::deserialize(&body)?;

    BlockIndex::validate_flags(root.source.index.flags)
        .map_err(|_| IndexError::ReservedFlagBits { flags: root.source.index.flags })?;
    for block in &root.source.blocks {
        BlockIndex::validate_flags(block.index.flags)
            .map_err(|_| IndexError::ReservedFlagBits { flags: block.index.flags })?;
    }
    let _ = flags::DEFINED_MASK;

    Ok(root)
}

/// Validate a loaded index's `sha256` against the current contents of
/// `path`, so the reader's pre-filter never trusts a stale index (the
/// source was truncated, rewritten, or rotated since the index was built).
pub fn validate_against_source(root: &Root, path: &Path, source_bytes: &[u8]) -> Result<(), IndexError> {
    let found = sha256(source_bytes);
    if found != root.source.sha256 {
        return Err(IndexError::Stale {
            expected: hex(&root.source.sha256),
            found: hex(&found),
        });
    }
    let _ = path;
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
