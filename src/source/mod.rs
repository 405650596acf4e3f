pub mod reader;
pub mod record_parser;
pub mod timestamp;

pub use reader::{BlockReader, CompressedBlockReader, FileBlockReader, RawBlock, StreamBlockReader};
pub use record_parser::{JsonLineParser, PatternLineParser, RawRecord, RecordParser, RecordParserError};
pub use timestamp::{TimestampError, TimestampExtractor, TimestampFormat};
