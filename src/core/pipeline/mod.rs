//! Transfer pipeline: outbound pump and file sources on the sending side,
//! delivery sinks on the receiving side.

pub mod sender;
pub mod sink;

pub use sender::{FileSource, MemoryFiles, SharedFiles};
pub use sink::{DeliverySink, FileSink, MemorySink, SinkWriter};
