//! Avro decoder for the trade envelope
//!
//! Payloads are raw Avro datums (no object container header) written against
//! the trade envelope schema: a record with a `data` array of trades and a
//! `type` string. Each trade carries `s` (symbol), `p` (price), `v` (volume),
//! `t` (epoch milliseconds) and optional `c` (conditions).

use super::RecordDecoder;
use crate::error::{DecodeError, ProcessorError, Result};
use apache_avro::{from_avro_datum, types::Value as AvroValue, Schema as AvroSchema};
use chrono::{DateTime, TimeZone, Utc};
use std::io::Cursor;
use std::path::Path;
use tracing::trace;
use tradeflow_types::{RawEvent, TradeRecord};

/// Schema bundled with the crate, used when none is configured
pub const BUNDLED_TRADE_SCHEMA: &str = include_str!("../../schemas/trade.avsc");

/// Decoder for Avro-encoded trade envelopes
#[derive(Debug, Clone)]
pub struct AvroTradeDecoder {
    schema: AvroSchema,
}

impl AvroTradeDecoder {
    /// Create a decoder from a parsed schema
    pub fn new(schema: AvroSchema) -> Self {
        Self { schema }
    }

    /// Create a decoder using the bundled trade schema
    pub fn bundled() -> Result<Self> {
        Self::from_schema_str(BUNDLED_TRADE_SCHEMA)
    }

    /// Parse a schema definition
    pub fn from_schema_str(definition: &str) -> Result<Self> {
        let schema =
            AvroSchema::parse_str(definition).map_err(|e| ProcessorError::Configuration {
                source: format!("invalid trade schema: {}", e).into(),
            })?;
        Ok(Self::new(schema))
    }

    /// Load the schema from a file once at startup
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let definition = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProcessorError::Configuration {
                source: format!("cannot read schema {}: {}", path.as_ref().display(), e).into(),
            }
        })?;
        Self::from_schema_str(&definition)
    }

    /// The schema payloads are validated against
    pub fn schema(&self) -> &AvroSchema {
        &self.schema
    }

    fn envelope_entries(value: AvroValue) -> std::result::Result<Vec<AvroValue>, String> {
        let fields = match value {
            AvroValue::Record(fields) => fields,
            other => return Err(format!("expected envelope record, found {:?}", kind(&other))),
        };

        let data = fields
            .into_iter()
            .find_map(|(name, value)| (name == "data").then_some(value))
            .ok_or_else(|| "envelope has no 'data' field".to_string())?;

        match unwrap_union(data) {
            AvroValue::Array(items) => Ok(items),
            other => Err(format!("'data' must be an array, found {:?}", kind(&other))),
        }
    }

    fn convert_entry(
        event: &RawEvent,
        entry_index: u32,
        entry: AvroValue,
    ) -> std::result::Result<TradeRecord, String> {
        let fields = match unwrap_union(entry) {
            AvroValue::Record(fields) => fields,
            other => {
                return Err(format!(
                    "entry {} is not a record: {:?}",
                    entry_index,
                    kind(&other)
                ))
            }
        };

        let mut symbol = None;
        let mut price = None;
        let mut volume = None;
        let mut event_time = None;
        let mut conditions = Vec::new();

        for (name, value) in fields {
            let value = unwrap_union(value);
            match name.as_str() {
                "s" => symbol = Some(as_string(&name, value)?),
                "p" => price = Some(as_f64(&name, value)?),
                "v" => volume = Some(as_f64(&name, value)?),
                "t" => event_time = Some(millis_to_timestamp(as_i64(&name, value)?)?),
                "c" => conditions = as_conditions(value)?,
                _ => {}
            }
        }

        let missing = |field: &str| format!("entry {} is missing '{}'", entry_index, field);
        Ok(TradeRecord {
            symbol: symbol.ok_or_else(|| missing("s"))?,
            price: price.ok_or_else(|| missing("p"))?,
            volume: volume.ok_or_else(|| missing("v"))?,
            event_time: event_time.ok_or_else(|| missing("t"))?,
            source_offset: event.source_offset,
            source_partition: event.source_partition,
            entry_index,
            conditions,
        })
    }

    fn decode_payload(&self, event: &RawEvent) -> std::result::Result<Vec<TradeRecord>, String> {
        let mut cursor = Cursor::new(event.payload.as_slice());
        let value = from_avro_datum(&self.schema, &mut cursor, None).map_err(|e| e.to_string())?;

        let consumed = cursor.position() as usize;
        if consumed != event.payload.len() {
            return Err(format!(
                "{} trailing bytes after envelope",
                event.payload.len() - consumed
            ));
        }

        Self::envelope_entries(value)?
            .into_iter()
            .enumerate()
            .map(|(index, entry)| Self::convert_entry(event, index as u32, entry))
            .collect()
    }
}

impl RecordDecoder for AvroTradeDecoder {
    fn decode(&self, event: &RawEvent) -> std::result::Result<Vec<TradeRecord>, DecodeError> {
        let records = self.decode_payload(event).map_err(|cause| DecodeError {
            partition: event.source_partition,
            offset: event.source_offset,
            payload: event.payload.clone(),
            cause,
        })?;

        trace!(
            partition = event.source_partition,
            offset = event.source_offset,
            records = records.len(),
            "Decoded payload"
        );
        Ok(records)
    }
}

/// Convert epoch milliseconds with integer arithmetic only
fn millis_to_timestamp(millis: i64) -> std::result::Result<DateTime<Utc>, String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| format!("timestamp {} out of range", millis))
}

fn unwrap_union(value: AvroValue) -> AvroValue {
    match value {
        AvroValue::Union(_, inner) => unwrap_union(*inner),
        other => other,
    }
}

fn as_string(field: &str, value: AvroValue) -> std::result::Result<String, String> {
    match value {
        AvroValue::String(s) => Ok(s),
        other => Err(format!("'{}' must be a string, found {:?}", field, kind(&other))),
    }
}

fn as_f64(field: &str, value: AvroValue) -> std::result::Result<f64, String> {
    match value {
        AvroValue::Double(v) => Ok(v),
        AvroValue::Float(v) => Ok(v as f64),
        AvroValue::Long(v) => Ok(v as f64),
        AvroValue::Int(v) => Ok(v as f64),
        other => Err(format!("'{}' must be numeric, found {:?}", field, kind(&other))),
    }
}

fn as_i64(field: &str, value: AvroValue) -> std::result::Result<i64, String> {
    match value {
        AvroValue::Long(v) | AvroValue::TimestampMillis(v) => Ok(v),
        AvroValue::Int(v) => Ok(v as i64),
        other => Err(format!("'{}' must be a long, found {:?}", field, kind(&other))),
    }
}

fn as_conditions(value: AvroValue) -> std::result::Result<Vec<String>, String> {
    match value {
        AvroValue::Null => Ok(Vec::new()),
        AvroValue::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match unwrap_union(item) {
                AvroValue::String(s) => Some(s),
                _ => None,
            })
            .collect()),
        other => Err(format!("'c' must be an array, found {:?}", kind(&other))),
    }
}

fn kind(value: &AvroValue) -> &'static str {
    match value {
        AvroValue::Null => "null",
        AvroValue::Boolean(_) => "boolean",
        AvroValue::Int(_) => "int",
        AvroValue::Long(_) => "long",
        AvroValue::Float(_) => "float",
        AvroValue::Double(_) => "double",
        AvroValue::String(_) => "string",
        AvroValue::Bytes(_) => "bytes",
        AvroValue::Array(_) => "array",
        AvroValue::Map(_) => "map",
        AvroValue::Record(_) => "record",
        AvroValue::Union(_, _) => "union",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::to_avro_datum;

    fn entry(symbol: &str, price: f64, volume: f64, t: i64) -> AvroValue {
        AvroValue::Record(vec![
            ("c".to_string(), AvroValue::Union(0, Box::new(AvroValue::Null))),
            ("p".to_string(), AvroValue::Double(price)),
            ("s".to_string(), AvroValue::String(symbol.to_string())),
            ("t".to_string(), AvroValue::Long(t)),
            ("v".to_string(), AvroValue::Double(volume)),
        ])
    }

    fn envelope(decoder: &AvroTradeDecoder, entries: Vec<AvroValue>) -> Vec<u8> {
        let value = AvroValue::Record(vec![
            ("data".to_string(), AvroValue::Array(entries)),
            ("type".to_string(), AvroValue::String("trade".to_string())),
        ]);
        to_avro_datum(decoder.schema(), value).unwrap()
    }

    #[test]
    fn test_fan_out_preserves_entry_order() {
        let decoder = AvroTradeDecoder::bundled().unwrap();
        let payload = envelope(
            &decoder,
            vec![entry("AAA", 100.0, 10.0, 0), entry("AAA", 102.0, 5.0, 500)],
        );

        let records = decoder.decode(&RawEvent::new(payload, 0, 7)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].price, 100.0);
        assert_eq!(records[0].event_time_millis(), 0);
        assert_eq!(records[1].event_time_millis(), 500);
        assert_eq!(
            records[1].event_time.format("%H:%M:%S%.3f").to_string(),
            "00:00:00.500"
        );
        assert!(records.iter().all(|r| r.source_offset == 7));
        assert_eq!(records[0].entry_index, 0);
        assert_eq!(records[1].entry_index, 1);
    }

    #[test]
    fn test_empty_array_yields_no_records() {
        let decoder = AvroTradeDecoder::bundled().unwrap();
        let payload = envelope(&decoder, vec![]);
        let records = decoder.decode(&RawEvent::new(payload, 0, 1)).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let decoder = AvroTradeDecoder::bundled().unwrap();
        let payload = vec![0xff, 0xff, 0xff, 0xff, 0x0f];
        let err = decoder
            .decode(&RawEvent::new(payload.clone(), 3, 42))
            .unwrap_err();
        assert_eq!(err.partition, 3);
        assert_eq!(err.offset, 42);
        assert_eq!(err.payload, payload);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let decoder = AvroTradeDecoder::bundled().unwrap();
        let mut payload = envelope(&decoder, vec![entry("AAA", 1.0, 1.0, 0)]);
        payload.push(0x00);
        let err = decoder.decode(&RawEvent::new(payload, 0, 0)).unwrap_err();
        assert!(err.cause.contains("trailing"));
    }

    #[test]
    fn test_conditions_carried_through() {
        let decoder = AvroTradeDecoder::bundled().unwrap();
        let with_conditions = AvroValue::Record(vec![
            (
                "c".to_string(),
                AvroValue::Union(
                    1,
                    Box::new(AvroValue::Array(vec![
                        AvroValue::Union(1, Box::new(AvroValue::String("1".to_string()))),
                        AvroValue::Union(0, Box::new(AvroValue::Null)),
                        AvroValue::Union(1, Box::new(AvroValue::String("12".to_string()))),
                    ])),
                ),
            ),
            ("p".to_string(), AvroValue::Double(7.5)),
            ("s".to_string(), AvroValue::String("BBB".to_string())),
            ("t".to_string(), AvroValue::Long(1_000)),
            ("v".to_string(), AvroValue::Double(2.0)),
        ]);
        let payload = envelope(&decoder, vec![with_conditions]);
        let records = decoder.decode(&RawEvent::new(payload, 0, 0)).unwrap();
        assert_eq!(records[0].conditions, vec!["1".to_string(), "12".to_string()]);
    }

    #[test]
    fn test_negative_millis_convert_exactly() {
        let ts = millis_to_timestamp(-1).unwrap();
        assert_eq!(ts.timestamp_millis(), -1);
    }

    #[test]
    fn test_invalid_schema_is_configuration_error() {
        let err = AvroTradeDecoder::from_schema_str("{not json").unwrap_err();
        assert!(matches!(err, ProcessorError::Configuration { .. }));
    }
}
