//! Payload decoding
//!
//! A [`RecordDecoder`] turns one opaque source payload into zero or more
//! [`TradeRecord`]s. Decoding is pure: the same payload always yields the same
//! records, which is what makes replay idempotent downstream.

pub mod avro;

pub use avro::AvroTradeDecoder;

use crate::error::DecodeError;
use tradeflow_types::{RawEvent, TradeRecord};

/// Decodes raw source events into trade records
pub trait RecordDecoder: Send + Sync {
    /// Decode one event
    ///
    /// An envelope with an empty entry list yields an empty vector. A payload
    /// that fails validation yields a [`DecodeError`] carrying the payload.
    fn decode(&self, event: &RawEvent) -> Result<Vec<TradeRecord>, DecodeError>;
}
