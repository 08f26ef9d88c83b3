//! Normalisation of the records a Lambda function is invoked with.
//!
//! A Kinesis event source mapping invokes the function with
//!
//! ```json
//! {
//!   "Records": [
//!     {
//!       "eventID": "shardId-000000000000:49545115243490985018280067714973144582180062593244200961",
//!       "eventName": "aws:kinesis:record",
//!       "kinesis": {
//!         "data": "SGVsbG8sIHRoaXMgaXMgYSB0ZXN0IDEyMy4=",
//!         "partitionKey": "partitionKey-3",
//!         "sequenceNumber": "49545115243490985018280067714973144582180062593244200961",
//!         "kinesisSchemaVersion": "1.0"
//!       }
//!     }
//!   ]
//! }
//! ```
//!
//! Records tagged as Kinesis records have their payload decoded. Untagged records are passed
//! through untouched, so a function can also be invoked directly with hand written records.
//! Records with any other tag are dropped.

use aws_lambda_events::encodings::Base64Data;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The `eventName` of records delivered from a Kinesis stream.
pub const KINESIS_EVENT_NAME: &str = "aws:kinesis:record";

/// Errors raised while normalising the records of an invocation.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record {index} is not a valid Kinesis record: {source}")]
    InvalidKinesisRecord {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Kinesis record {event_id} does not hold {expected}: {source}")]
    InvalidPayload {
        event_id: String,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A single record handed to a service.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A record read from a Kinesis stream, with its payload decoded.
    Kinesis(KinesisRecord),
    /// An untagged record, as it was given to the function.
    Direct(Value),
}

impl Record {
    /// The identifier of the record, if it has one.
    ///
    /// For Kinesis records this is the `eventID`, `<shard id>:<sequence number>`.
    pub fn id(&self) -> Option<&str> {
        match self {
            Record::Kinesis(record) => Some(&record.event_id),
            Record::Direct(value) => value.get("eventID").and_then(Value::as_str),
        }
    }

    pub fn as_kinesis(&self) -> Option<&KinesisRecord> {
        match self {
            Record::Kinesis(record) => Some(record),
            Record::Direct(_) => None,
        }
    }
}

/// A decoded Kinesis record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KinesisRecord {
    pub event_id: String,
    pub partition_key: String,
    pub sequence_number: String,
    pub kinesis_schema_version: Option<String>,
    /// The decoded payload.
    pub data: Bytes,
}

impl KinesisRecord {
    /// The payload as UTF-8 text.
    pub fn data_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.data)
    }

    /// Deserialise the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RecordError> {
        serde_json::from_slice(&self.data).map_err(|source| RecordError::InvalidPayload {
            event_id: self.event_id.clone(),
            expected: std::any::type_name::<T>(),
            source,
        })
    }

    /// The shard this record was read from.
    pub fn shard_id(&self) -> &str {
        shard_id(&self.event_id)
    }
}

#[derive(Deserialize)]
struct RawKinesisRecord {
    #[serde(rename = "eventID")]
    event_id: String,
    kinesis: RawKinesisPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKinesisPayload {
    data: Base64Data,
    partition_key: String,
    sequence_number: String,
    #[serde(default)]
    kinesis_schema_version: Option<String>,
}

impl From<RawKinesisRecord> for KinesisRecord {
    fn from(raw: RawKinesisRecord) -> Self {
        KinesisRecord {
            event_id: raw.event_id,
            partition_key: raw.kinesis.partition_key,
            sequence_number: raw.kinesis.sequence_number,
            kinesis_schema_version: raw.kinesis.kinesis_schema_version,
            data: Bytes::from(raw.kinesis.data.0),
        }
    }
}

/// Turn an invocation payload into the records handed to a service.
///
/// A payload without a `Records` array is a direct invocation and is handed over as a single
/// [Record::Direct].
pub fn normalize(payload: Value) -> Result<Vec<Record>, RecordError> {
    let records = match payload {
        Value::Object(mut event) => match event.remove("Records") {
            Some(Value::Array(records)) => records,
            Some(other) => {
                event.insert("Records".to_owned(), other);
                return Ok(vec![Record::Direct(Value::Object(event))]);
            }
            None => return Ok(vec![Record::Direct(Value::Object(event))]),
        },
        Value::Null => return Ok(vec![]),
        other => return Ok(vec![Record::Direct(other)]),
    };

    let mut normalized = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        match record.get("eventName") {
            None => normalized.push(Record::Direct(record)),
            Some(Value::String(name)) if name == KINESIS_EVENT_NAME => {
                let raw: RawKinesisRecord = serde_json::from_value(record)
                    .map_err(|source| RecordError::InvalidKinesisRecord { index, source })?;
                normalized.push(Record::Kinesis(raw.into()));
            }
            Some(name) => tracing::debug!("Skipping record {index} with eventName {name}"),
        }
    }
    Ok(normalized)
}

/// The shard id portion of a Kinesis `eventID`.
pub fn shard_id(event_id: &str) -> &str {
    event_id.split_once(':').map_or(event_id, |(shard, _)| shard)
}

/// The sequence number portion of a Kinesis `eventID`.
pub fn sequence_number(event_id: &str) -> &str {
    event_id.split_once(':').map_or(event_id, |(_, sequence)| sequence)
}

/// The completion message reported for a batch of record ids.
pub fn summarize<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let ids: Vec<&str> = ids.into_iter().collect();
    format!("Processed events: {}", ids.join(" "))
}


#[cfg(test)]
mod test {
    use super::fixtures::*;
    use super::*;

    use assert_matches::assert_matches;
    use serde_json::json;
    use test_strategy::proptest;

    const SEQUENCE: &str = "49545115243490985018280067714973144582180062593244200961";

    #[test]
    fn test_decodes_kinesis_records() {
        let records = normalize(event(vec![kinesis_record(
            SEQUENCE,
            "Hello, this is a test 123.",
        )]))
        .unwrap();
        assert_eq!(records.len(), 1);
        let record = records[0].as_kinesis().unwrap();
        assert_eq!(record.data_str().unwrap(), "Hello, this is a test 123.");
        assert_eq!(record.partition_key, "partitionKey-3");
        assert_eq!(record.sequence_number, SEQUENCE);
        assert_eq!(record.kinesis_schema_version.as_deref(), Some("1.0"));
        assert_eq!(record.shard_id(), SHARD);
        assert_eq!(records[0].id(), Some(format!("{SHARD}:{SEQUENCE}").as_str()));
    }

    #[test]
    fn test_filters_foreign_records() {
        let dynamo = json!({"eventName": "INSERT", "eventID": "1", "dynamodb": {}});
        let records = normalize(event(vec![
            kinesis_record("1", "a"),
            dynamo,
            kinesis_record("2", "b"),
        ]))
        .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.as_kinesis().is_some()));
    }

    #[test]
    fn test_untagged_records_pass_through() {
        let untagged = json!({"eventID": "manual-1", "data": "not base64!"});
        let records = normalize(event(vec![untagged.clone(), kinesis_record("1", "a")])).unwrap();
        assert_eq!(records[0], Record::Direct(untagged));
        assert_eq!(records[0].id(), Some("manual-1"));
        assert_matches!(records[1], Record::Kinesis(_));
    }

    #[test]
    fn test_direct_invocation_payload() {
        let payload = json!({"val": "value"});
        assert_eq!(
            normalize(payload.clone()).unwrap(),
            vec![Record::Direct(payload)]
        );
        assert_eq!(normalize(Value::Null).unwrap(), vec![]);
        assert_eq!(normalize(event(vec![])).unwrap(), vec![]);
    }

    #[test]
    fn test_bad_payload_is_an_error() {
        let mut record = kinesis_record("1", "a");
        record["kinesis"]["data"] = json!("%%% not base64 %%%");
        let e = normalize(event(vec![kinesis_record("0", "ok"), record])).unwrap_err();
        assert_matches!(e, RecordError::InvalidKinesisRecord { index: 1, .. });
    }

    #[test]
    fn test_json_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Message {
            target: String,
        }
        let records = normalize(event(vec![
            kinesis_record("1", r#"{"target": "world"}"#),
            kinesis_record("2", "nope"),
        ]))
        .unwrap();
        let message: Message = records[0].as_kinesis().unwrap().json().unwrap();
        assert_eq!(message.target, "world");
        let e = records[1].as_kinesis().unwrap().json::<Message>().unwrap_err();
        assert_matches!(e, RecordError::InvalidPayload { ref event_id, .. } if event_id.ends_with(":2"));
    }

    #[test]
    fn test_event_id_parts() {
        let id = format!("{SHARD}:{SEQUENCE}");
        assert_eq!(shard_id(&id), SHARD);
        assert_eq!(sequence_number(&id), SEQUENCE);
        assert_eq!(shard_id("no-colon"), "no-colon");
        assert_eq!(sequence_number("no-colon"), "no-colon");
    }

    #[test]
    fn test_summary() {
        let records = normalize(event(vec![
            kinesis_record(SEQUENCE, "x"),
            json!({"no": "id"}),
        ]))
        .unwrap();
        assert_eq!(
            summarize(records.iter().filter_map(Record::id)),
            format!("Processed events: {SHARD}:{SEQUENCE}")
        );
        assert_eq!(summarize([]), "Processed events: ");
    }

    #[proptest]
    fn test_summary_keeps_input_order(
        #[strategy(proptest::collection::vec(0u64..1_000_000, 0..20))] sequences: Vec<u64>,
    ) {
        let raw = sequences
            .iter()
            .map(|s| kinesis_record(&s.to_string(), "payload"))
            .collect();
        let records = normalize(event(raw)).unwrap();
        let expected: Vec<String> = sequences.iter().map(|s| format!("{SHARD}:{s}")).collect();
        assert_eq!(
            summarize(records.iter().filter_map(Record::id)),
            format!("Processed events: {}", expected.join(" "))
        );
    }
}
