//! Everything that writes into the vault or the archive.

pub mod archive;
pub mod daily;
pub mod index;
pub mod writer;

pub use archive::{ArchiveError, ArchiveManager, RecoverReport};
pub use daily::DailyLog;
pub use index::{FileIndex, IndexError, IndexHit, VectorIndex};
pub use writer::{NoteWriter, WriterError, WrittenNote};
