use compatdb_core::{ParsedReport, ReportBatch, ReportV1, ReportV2};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload matches no known report schema (V2: {v2}; V1: {v1})")]
    UnrecognizedSchema { v2: String, v1: String },
}

/// Decode a report payload, trying the newer schema before the legacy one.
///
/// Detection is all-or-nothing: a single record that fails the V2 shape sends
/// the whole payload to V1, and a payload that fits neither is rejected.
pub fn parse_payload(bytes: &[u8]) -> Result<ReportBatch, ParseError> {
    let values: Vec<JsonValue> = serde_json::from_slice(bytes).map_err(|err| {
        let reason = format!("not a JSON array: {err}");
        ParseError::UnrecognizedSchema {
            v2: reason.clone(),
            v1: reason,
        }
    })?;

    let v2 = match decode_all::<ReportV2>(&values) {
        Ok(records) => return Ok(ReportBatch::V2(pair(records, values))),
        Err(reason) => reason,
    };
    debug!(reason = %v2, "payload is not V2, trying V1");

    match decode_all::<ReportV1>(&values) {
        Ok(records) => Ok(ReportBatch::V1(pair(records, values))),
        Err(v1) => Err(ParseError::UnrecognizedSchema { v2, v1 }),
    }
}

fn decode_all<T: DeserializeOwned>(values: &[JsonValue]) -> Result<Vec<T>, String> {
    values
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            if !value.is_object() {
                return Err(format!("record {idx} is not an object"));
            }
            T::deserialize(value).map_err(|err| format!("record {idx}: {err}"))
        })
        .collect()
}

fn pair<T>(records: Vec<T>, values: Vec<JsonValue>) -> Vec<ParsedReport<T>> {
    records
        .into_iter()
        .zip(values)
        .map(|(record, value)| ParsedReport {
            record,
            raw: match value {
                JsonValue::Object(map) => map,
                _ => Map::new(),
            },
        })
        .collect()
}
