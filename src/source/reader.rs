//! The reader stage: produces a totally-ordered stream of raw
//! blocks from one of the three ingestion modes. `generation` is minted
//! here and nowhere else.

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::ReaderError;
use crate::filter::Filter;
use crate::index::Root as IndexRoot;

/// A contiguous, line-bounded range of source bytes, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub generation: u64,
    pub offset: u64,
    pub size: u64,
    pub bytes: Vec<u8>,
}

/// Produces the next raw block, or `None` at end of source. Implementors
/// own the one place `generation` increases.
pub trait BlockReader: Send {
    fn next_block(&mut self) -> Result<Option<RawBlock>, ReaderError>;
}

/// Splits `bytes` into line-bounded chunks targeting `target_size` each,
/// extending every chunk to the next newline so a block never splits a
/// line (the block-boundary rule). A trailing partial line at
/// the very end of `bytes` is discarded; the second return value reports
/// whether that happened, so callers can count it `invalid`.
pub fn split_into_blocks(bytes: &[u8], target_size: u64) -> (Vec<Range<usize>>, bool) {
    let mut blocks = Vec::new();
    let mut start = 0usize;
    let target = target_size.max(1) as usize;

    while start < bytes.len() {
        let mut end = (start + target).min(bytes.len());
        if end < bytes.len() {
            match bytes[end..].iter().position(|&b| b == b'\n') {
                Some(rel) => end += rel + 1,
                None => end = bytes.len(),
            }
        }
        blocks.push(start..end);
        start = end;
    }

    let trailing_invalid = !matches!(bytes.last(), Some(&b'\n') | None);

    if trailing_invalid {
        if let Some(last) = blocks.last().cloned() {
            match bytes[last.clone()].iter().rposition(|&b| b == b'\n') {
                Some(nl) => {
                    let new_end = last.start + nl + 1;
                    blocks.pop();
                    if new_end > last.start {
                        blocks.push(last.start..new_end);
                    }
                }
                None => {
                    blocks.pop();
                }
            }
        }
    }

    (blocks, trailing_invalid)
}

/// Regular-file mode: the source is memory-mapped and blocks are produced
/// as `(offset, size)` descriptors sliced out of the mapping on demand.
/// If a persistent index is supplied, block
/// boundaries come straight from `index.source.blocks` and any block whose
/// `BlockIndex` the filter rejects is skipped entirely — it is never even
/// handed to a parser.
pub struct FileBlockReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
    target_size: u64,
    next_offset: u64,
    next_generation: u64,
    planned_blocks: Option<std::vec::IntoIter<crate::index::SourceBlock>>,
}

impl FileBlockReader {
    pub fn open(path: &Path, target_size: u64) -> Result<Self, ReaderError> {
        let file = File::open(path).map_err(|source| ReaderError::SourceIo {
            path: path.to_path_buf(),
            source,
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| ReaderError::Mmap {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.to_path_buf(),
            target_size,
            next_offset: 0,
            next_generation: 0,
            planned_blocks: None,
        })
    }

    /// Attach a persistent index so blocks whose `BlockIndex` the filter
    /// rejects are skipped before ever being read.
    pub fn with_index(mut self, index: &IndexRoot, filter: &dyn Filter) -> Self {
        let accepted: Vec<_> = index
            .source
            .blocks
            .iter()
            .filter(|b| {
                b.index
                    .to_block_index()
                    .map(|bi| filter.accept_block(&bi))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        self.planned_blocks = Some(accepted.into_iter());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mmap_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }
}

impl BlockReader for FileBlockReader {
    fn next_block(&mut self) -> Result<Option<RawBlock>, ReaderError> {
        if let Some(planned) = &mut self.planned_blocks {
            return Ok(planned.next().map(|sb| {
                let generation = self.next_generation;
                self.next_generation += 1;
                RawBlock {
                    generation,
                    offset: sb.offset,
                    size: sb.size,
                    bytes: self.mmap[sb.offset as usize..(sb.offset + sb.size) as usize].to_vec(),
                }
            }));
        }

        let data = &self.mmap[..];
        if self.next_offset as usize >= data.len() {
            return Ok(None);
        }

        let start = self.next_offset as usize;
        let mut end = (start + self.target_size.max(1) as usize).min(data.len());
        if end < data.len() {
            match data[end..].iter().position(|&b| b == b'\n') {
                Some(rel) => end += rel + 1,
                None => end = data.len(),
            }
        }

        // Trailing partial line at end of source: discard.
        if end == data.len() && data[start..end].last() != Some(&b'\n') {
            match data[start..end].iter().rposition(|&b| b == b'\n') {
                Some(nl) => end = start + nl + 1,
                None => {
                    self.next_offset = data.len() as u64;
                    return Ok(None);
                }
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.next_offset = end as u64;

        Ok(Some(RawBlock {
            generation,
            offset: start as u64,
            size: (end - start) as u64,
            bytes: data[start..end].to_vec(),
        }))
    }
}

/// Stream mode: reads sequentially from a non-seekable `Read`, accumulating
/// bytes into line-bounded blocks of roughly `target_size`. Bytes are owned
/// outright since the source can't be re-read.
pub struct StreamBlockReader<R> {
    source: R,
    target_size: usize,
    next_offset: u64,
    next_generation: u64,
    carry: Vec<u8>,
    eof: bool,
}

impl<R: Read> StreamBlockReader<R> {
    pub fn new(source: R, target_size: u64) -> Self {
        Self {
            source,
            target_size: target_size.max(1) as usize,
            next_offset: 0,
            next_generation: 0,
            carry: Vec::new(),
            eof: false,
        }
    }

    fn read_more(&mut self) -> Result<(), ReaderError> {
        let mut buf = vec![0u8; self.target_size.min(1 << 20)];
        loop {
            let n = self.source.read(&mut buf).map_err(|source| ReaderError::SourceIo {
                path: PathBuf::from("<stream>"),
                source,
            })?;
            if n == 0 {
                self.eof = true;
                return Ok(());
            }
            self.carry.extend_from_slice(&buf[..n]);
            if self.carry.len() >= self.target_size {
                return Ok(());
            }
        }
    }
}

impl<R: Read + Send> BlockReader for StreamBlockReader<R> {
    fn next_block(&mut self) -> Result<Option<RawBlock>, ReaderError> {
        loop {
            if self.carry.len() < self.target_size && !self.eof {
                self.read_more()?;
                continue;
            }
            if self.carry.is_empty() {
                return Ok(None);
            }

            let mut end = self.target_size.min(self.carry.len());
            if end < self.carry.len() {
                match self.carry[end..].iter().position(|&b| b == b'\n') {
                    Some(rel) => end += rel + 1,
                    None => end = self.carry.len(),
                }
            }

            if end == self.carry.len() && self.carry.last() != Some(&b'\n') && self.eof {
                match self.carry.iter().rposition(|&b| b == b'\n') {
                    Some(nl) => end = nl + 1,
                    None => {
                        // Entire remainder is a trailing partial line: discard.
                        self.carry.clear();
                        return Ok(None);
                    }
                }
            }
            if end == 0 {
                return Ok(None);
            }

            let block_bytes: Vec<u8> = self.carry.drain(..end).collect();
            let offset = self.next_offset;
            let generation = self.next_generation;
            self.next_generation += 1;
            self.next_offset += block_bytes.len() as u64;
            return Ok(Some(RawBlock {
                generation,
                offset,
                size: block_bytes.len() as u64,
                bytes: block_bytes,
            }));
        }
    }
}

/// Writer side of the compressed-file container: one zstd-compressed,
/// line-bounded block per frame, `[u64 LE uncompressed_len][u32 LE
/// compressed_len][zstd bytes]`.
pub struct CompressedFrameWriter<W> {
    sink: W,
}

impl<W: std::io::Write> CompressedFrameWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn write_block(&mut self, bytes: &[u8]) -> Result<(), ReaderError> {
        let compressed = zstd::stream::encode_all(bytes, 0).map_err(|source| ReaderError::SourceIo {
            path: PathBuf::from("<compressed write>"),
            source,
        })?;
        self.sink
            .write_all(&(bytes.len() as u64).to_le_bytes())
            .and_then(|_| self.sink.write_all(&(compressed.len() as u32).to_le_bytes()))
            .and_then(|_| self.sink.write_all(&compressed))
            .map_err(|source| ReaderError::SourceIo {
                path: PathBuf::from("<compressed write>"),
                source,
            })
    }
}

/// Splits `bytes` on line boundaries at `target_size` and writes each chunk
/// as a compressed frame — the fixture-building counterpart to
/// `CompressedBlockReader` (compressed-file mode: blocks are
/// container-defined).
pub fn write_compressed_container<W: std::io::Write>(
    sink: W,
    bytes: &[u8],
    target_size: u64,
) -> Result<(), ReaderError> {
    let (ranges, _) = split_into_blocks(bytes, target_size);
    let mut writer = CompressedFrameWriter::new(sink);
    for range in ranges {
        writer.write_block(&bytes[range])?;
    }
    Ok(())
}

/// Compressed-file mode: a seekable container of independently-compressed,
/// line-bounded blocks. When a persistent index is attached, a block the
/// filter rejects is skipped without ever being decompressed: blocks are
/// pre-filtered against the persistent index so fully-rejected blocks are
/// never decompressed.
pub struct CompressedBlockReader<R> {
    source: R,
    next_generation: u64,
    next_offset: u64,
    planned: Option<std::vec::IntoIter<bool>>,
}

impl<R: Read> CompressedBlockReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            next_generation: 0,
            next_offset: 0,
            planned: None,
        }
    }

    /// Attach a persistent index; `accepted[i]` says whether the i-th frame
    /// in read order should be decompressed at all.
    pub fn with_index(mut self, index: &IndexRoot, filter: &dyn Filter) -> Self {
        let accepted: Vec<bool> = index
            .source
            .blocks
            .iter()
            .map(|b| {
                b.index
                    .to_block_index()
                    .map(|bi| filter.accept_block(&bi))
                    .unwrap_or(true)
            })
            .collect();
        self.planned = Some(accepted.into_iter());
        self
    }

    /// Returns `Ok(true)` on a clean EOF with nothing read, `Ok(false)`
    /// once `buf` is fully populated, `Err` on a short read mid-frame.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, ReaderError> {
        let mut read = 0;
        while read < buf.len() {
            let n = self
                .source
                .read(&mut buf[read..])
                .map_err(|source| ReaderError::SourceIo {
                    path: PathBuf::from("<compressed read>"),
                    source,
                })?;
            if n == 0 {
                if read == 0 {
                    return Ok(true);
                }
                return Err(ReaderError::SourceIo {
                    path: PathBuf::from("<compressed read>"),
                    source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated frame header"),
                });
            }
            read += n;
        }
        Ok(false)
    }
}

impl<R: Read + Send> BlockReader for CompressedBlockReader<R> {
    fn next_block(&mut self) -> Result<Option<RawBlock>, ReaderError> {
        loop {
            let mut header = [0u8; 12];
            if self.read_exact_or_eof(&mut header)? {
                return Ok(None);
            }
            let uncompressed_len = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let compressed_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

            let mut compressed = vec![0u8; compressed_len];
            if self.read_exact_or_eof(&mut compressed)? {
                return Err(ReaderError::SourceIo {
                    path: PathBuf::from("<compressed read>"),
                    source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated frame body"),
                });
            }

            let accepted = match &mut self.planned {
                Some(iter) => iter.next().unwrap_or(true),
                None => true,
            };

            let generation = self.next_generation;
            self.next_generation += 1;
            let offset = self.next_offset;
            self.next_offset += uncompressed_len;

            if !accepted {
                continue;
            }

            let mut bytes = Vec::with_capacity(uncompressed_len as usize);
            zstd::stream::copy_decode(compressed.as_slice(), &mut bytes).map_err(|source| ReaderError::SourceIo {
                path: PathBuf::from("<compressed decode>"),
                source,
            })?;

            return Ok(Some(RawBlock {
                generation,
                offset,
                size: bytes.len() as u64,
                bytes,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::LevelWindowFilter;
    use std::io::Cursor;
    use std::io::Write as _;

    #[test]
    fn split_into_blocks_never_splits_a_line() {
        let bytes = b"aaaa\nbbbb\ncccc\ndddd\n";
        let (ranges, trailing) = split_into_blocks(bytes, 9);
        assert!(!trailing);
        for range in &ranges {
            assert!(bytes[range.clone()].ends_with(b"\n"));
        }
        let total: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(total, bytes.len());
    }

    #[test]
    fn split_into_blocks_discards_trailing_partial_line() {
        let bytes = b"aaaa\nbbbb\npartial";
        let (ranges, trailing) = split_into_blocks(bytes, 100);
        assert!(trailing);
        let joined: Vec<u8> = ranges.iter().flat_map(|r| bytes[r.clone()].to_vec()).collect();
        assert_eq!(joined, b"aaaa\nbbbb\n");
    }

    #[test]
    fn file_reader_assigns_increasing_generations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"one\ntwo\nthree\nfour\n").unwrap();
        let mut reader = FileBlockReader::open(file.path(), 5).unwrap();
        let mut generations = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            generations.push(block.generation);
        }
        assert_eq!(generations, (0..generations.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn file_reader_drops_trailing_partial_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"complete line\nincomplete").unwrap();
        let mut reader = FileBlockReader::open(file.path(), 1024).unwrap();
        let block = reader.next_block().unwrap().unwrap();
        assert_eq!(block.bytes, b"complete line\n");
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn stream_reader_reassembles_line_bounded_blocks() {
        let data = b"one\ntwo\nthree\nfour\nfive\n".to_vec();
        let cursor = Cursor::new(data.clone());
        let mut reader = StreamBlockReader::new(cursor, 8);
        let mut all = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            assert!(block.bytes.ends_with(b"\n") || block.bytes.is_empty());
            all.extend_from_slice(&block.bytes);
        }
        assert_eq!(all, data);
    }

    #[test]
    fn compressed_reader_round_trips_blocks() {
        let data = b"alpha\nbeta\ngamma\ndelta\n".to_vec();
        let mut container = Vec::new();
        write_compressed_container(&mut container, &data, 10).unwrap();

        let mut reader = CompressedBlockReader::new(Cursor::new(container));
        let mut all = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            all.extend_from_slice(&block.bytes);
        }
        assert_eq!(all, data);
    }

    #[test]
    fn compressed_reader_skips_rejected_blocks_via_index() {
        use crate::index::{Index as IdxIndex, Root, SourceBlock, SourceFile};
        use crate::model::block::flags;

        let data = b"one\ntwo\n".to_vec();
        let mut container = Vec::new();
        write_compressed_container(&mut container, &data, 4).unwrap();

        let root = Root {
            source: SourceFile {
                size: data.len() as u64,
                sha256: crate::index::sha256(&data),
                path: "x".into(),
                modified: 0,
                index: IdxIndex {
                    flags: flags::LEVEL_INFO,
                    lines: (2, 0),
                    timestamps: (false, 0, 0),
                },
                blocks: vec![
                    SourceBlock {
                        offset: 0,
                        size: 4,
                        index: IdxIndex {
                            flags: flags::LEVEL_ERROR,
                            lines: (1, 0),
                            timestamps: (false, 0, 0),
                        },
                    },
                    SourceBlock {
                        offset: 4,
                        size: 4,
                        index: IdxIndex {
                            flags: flags::LEVEL_INFO,
                            lines: (1, 0),
                            timestamps: (false, 0, 0),
                        },
                    },
                ],
            },
        };
        let filter = LevelWindowFilter::new(flags::LEVEL_INFO, None);
        let mut reader = CompressedBlockReader::new(Cursor::new(container)).with_index(&root, &filter);

        let mut blocks = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            blocks.push(block);
        }
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].generation, 1);
    }
}
