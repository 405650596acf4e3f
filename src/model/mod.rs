pub mod block;
pub mod record;

pub use block::{Block, BlockIndex, LineCounts, TimestampRange};
pub use record::{Level, Record};
