//! In-memory indexes over the append-only data files.

mod hash_list;
mod long_list;

pub use hash_list::HashList;
pub use long_list::{LongList, CHUNK_LEN};
