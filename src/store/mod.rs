//! Persistence layer: encrypted, priority-ordered job storage on libSQL.

pub mod codec;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use codec::{DEFAULT_COMPRESSION_THRESHOLD, PayloadCodec};
pub use libsql_backend::LibSqlJobStore;
pub use traits::{JobStore, QuarantinedJob, QueueStats};
