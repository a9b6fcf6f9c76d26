pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod inject;
pub mod placeholder;
pub mod report;
pub mod statement;
mod sink;

pub use aggregate::{ChunkSummary, ChunkVerdict, OutcomeAggregator, RowFailure, TolerancePolicy, WriteOutcome};
pub use config::{FormatSection, InjectConfig, OutputConfig, TimeType};
pub use dispatch::{InFlightChunk, WriteDispatcher, WriteTask};
pub use error::SinkError;
pub use handle::SessionHandle;
pub use placeholder::InsertTarget;
pub use report::CompletionReporter;
pub use sink::CassandraJsonSink;
pub use statement::{InsertOptions, build_insert};
