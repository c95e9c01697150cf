//! Core types and data models for tradeflow
//!
//! This crate provides the records that flow between the source, the
//! aggregation engine and the storage collaborator.

pub mod aggregates;
pub mod events;

pub use aggregates::MinuteAggregate;
pub use events::{PartitionId, RawEvent, TradeRecord};
