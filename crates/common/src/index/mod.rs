//! The replicated metadata index a drive keeps its file table in.
//!
//! Two row kinds share one key space: name rows (filename -> hash) and
//!  content rows (hex hash -> [`FileRecord`]), plus the reserved
//!  `__publicKey` and `__access` rows.

mod entry;
mod memory;
mod provider;

pub use entry::{
    is_plain_filename, is_reserved, AccessRecord, ContentEntry, FileRecord, IndexEntry,
    IndexValue, NameEntry, ACCESS_KEY, PUBLIC_KEY_KEY, ROOT_PATH,
};
pub use memory::{MemoryIndex, MemoryIndexError};
pub use provider::{HistoryOptions, IndexError, IndexProvider};
