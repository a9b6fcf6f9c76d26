mod error;
mod session;
mod types;
mod util;

pub use error::{ErrorKind, StoreError};
pub use session::{ChunkCompletion, RecordFormatter, StoreSession};
pub use types::{Chunk, ChunkId, ChunkMetadata, Consistency, EventTime, Record, Statement};
pub use util::{now_ms, tag_part};
