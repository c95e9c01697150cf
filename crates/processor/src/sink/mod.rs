//! Output side of the pipeline
//!
//! - [`store`]: the storage collaborator and its in-memory and backend-backed
//!   implementations
//! - [`dispatcher`]: idempotent, retried delivery of raw trades and window
//!   aggregates
//! - [`dead_letter`]: destinations for undecodable and late inputs

pub mod dead_letter;
pub mod dispatcher;
pub mod store;

pub use dead_letter::{
    send_within, DeadLetter, DeadLetterReason, DeadLetterSink, FileDeadLetterSink,
    MemoryDeadLetterSink,
};
pub use dispatcher::SinkDispatcher;
pub use store::{BackendTableStore, MemoryTableStore, Row, Table, TableStore};
