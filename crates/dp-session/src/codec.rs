//! Snapshot codec: frames and metadata maps to compressed, type-tagged JSON.
//!
//! Every payload is a zlib stream wrapping one JSON envelope:
//!
//! ```text
//! {"format":"dp-session","version":1,"kind":"frame","body":{...}}
//! ```
//!
//! Frame bodies record the row count, the column order and, per column, a
//! dtype tag plus plain JSON cell values. Decoding only ever builds plain
//! data from that text; a payload that is not a zlib stream of a well-formed
//! envelope is rejected with [`Error::Serialization`].

use std::io::{Read, Write};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use dp_core::{Column, ColumnData, DType, DataFrame, Error, Result, SessionConfig};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// String-keyed map payload (descriptors, history records).
pub type Metadata = serde_json::Map<String, Value>;

const FORMAT_TAG: &str = "dp-session";
const FORMAT_VERSION: u32 = 1;

/// Naive layouts tried, in order, when a timestamp cell is not RFC 3339.
/// Matches are taken as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Converts session values to and from store bytes.
///
/// Implementations must be pure: no I/O, no shared mutable state.
pub trait SnapshotCodec: Send + Sync + 'static {
    fn encode_frame(&self, frame: &DataFrame) -> Result<Vec<u8>>;
    fn decode_frame(&self, bytes: &[u8]) -> Result<DataFrame>;
    fn encode_metadata(&self, metadata: &Metadata) -> Result<Vec<u8>>;
    fn decode_metadata(&self, bytes: &[u8]) -> Result<Metadata>;
}

/// Encode any struct that serializes to a JSON object as a metadata payload.
pub fn encode_record<T: Serialize>(codec: &dyn SnapshotCodec, record: &T) -> Result<Vec<u8>> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => codec.encode_metadata(&map),
        Ok(other) => Err(Error::Serialization(format!(
            "metadata record must serialize to a map, got {other}"
        ))),
        Err(e) => Err(Error::Serialization(format!("failed to serialize record: {e}"))),
    }
}

pub fn decode_record<T: DeserializeOwned>(codec: &dyn SnapshotCodec, bytes: &[u8]) -> Result<T> {
    let map = codec.decode_metadata(bytes)?;
    serde_json::from_value(Value::Object(map))
        .map_err(|e| Error::Serialization(format!("metadata record has unexpected shape: {e}")))
}

// ── Envelope ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PayloadKind {
    Frame,
    Metadata,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope<B> {
    format: String,
    version: u32,
    kind: PayloadKind,
    body: B,
}

impl<B> Envelope<B> {
    fn wrap(kind: PayloadKind, body: B) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            version: FORMAT_VERSION,
            kind,
            body,
        }
    }

    fn unwrap_as(self, expected: PayloadKind) -> Result<B> {
        if self.format != FORMAT_TAG {
            return Err(Error::Serialization(format!(
                "unknown payload format: {}",
                self.format
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported payload version: {}",
                self.version
            )));
        }
        if self.kind != expected {
            return Err(Error::Serialization(format!(
                "expected a {expected:?} payload, found {:?}",
                self.kind
            )));
        }
        Ok(self.body)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrameBody {
    rows: usize,
    columns: Vec<String>,
    data: Vec<WireColumn>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireColumn {
    name: String,
    dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    categories: Option<Vec<String>>,
    values: Vec<Value>,
}

// ── JsonCodec ────────────────────────────────────────────────────────

/// zlib-compressed JSON envelopes.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    level: u32,
    max_payload_bytes: u64,
}

impl Default for JsonCodec {
    fn default() -> Self {
        let config = SessionConfig::default();
        Self {
            level: config.compression_level,
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

impl JsonCodec {
    pub fn new(level: u32) -> Result<Self> {
        if !(1..=9).contains(&level) {
            return Err(Error::Validation(format!(
                "compression level must be within 1..=9, got {level}"
            )));
        }
        Ok(Self {
            level,
            ..Self::default()
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Ok(Self::new(config.compression_level)?.with_max_payload_bytes(config.max_payload_bytes))
    }

    pub fn with_max_payload_bytes(mut self, max_payload_bytes: u64) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    fn seal<B: Serialize>(&self, kind: PayloadKind, body: B) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&Envelope::wrap(kind, body))
            .map_err(|e| Error::Serialization(format!("failed to build envelope: {e}")))?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(&json)
            .map_err(|e| Error::Serialization(format!("compression failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| Error::Serialization(format!("compression failed: {e}")))
    }

    fn open<B: DeserializeOwned>(&self, kind: PayloadKind, bytes: &[u8]) -> Result<B> {
        let mut json = Vec::new();
        ZlibDecoder::new(bytes)
            .take(self.max_payload_bytes.saturating_add(1))
            .read_to_end(&mut json)
            .map_err(|e| Error::Serialization(format!("payload is not a valid zlib stream: {e}")))?;
        if json.len() as u64 > self.max_payload_bytes {
            return Err(Error::Serialization(format!(
                "payload exceeds {} bytes when decompressed",
                self.max_payload_bytes
            )));
        }
        let envelope: Envelope<B> = serde_json::from_slice(&json)
            .map_err(|e| Error::Serialization(format!("payload is not a valid envelope: {e}")))?;
        envelope.unwrap_as(kind)
    }
}

impl SnapshotCodec for JsonCodec {
    fn encode_frame(&self, frame: &DataFrame) -> Result<Vec<u8>> {
        let body = FrameBody {
            rows: frame.height(),
            columns: frame.column_names().into_iter().map(str::to_string).collect(),
            data: frame.columns().iter().map(encode_column).collect(),
        };
        self.seal(PayloadKind::Frame, body)
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<DataFrame> {
        let body: FrameBody = self.open(PayloadKind::Frame, bytes)?;

        let names: Vec<&str> = body.data.iter().map(|c| c.name.as_str()).collect();
        if names != body.columns {
            return Err(Error::Serialization(
                "column order does not match column data".into(),
            ));
        }
        if let Some(col) = body.data.iter().find(|c| c.values.len() != body.rows) {
            return Err(Error::Serialization(format!(
                "column {} has {} values, envelope declares {} rows",
                col.name,
                col.values.len(),
                body.rows
            )));
        }

        let columns = body.data.into_iter().map(restore_column).collect();
        DataFrame::new(columns).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn encode_metadata(&self, metadata: &Metadata) -> Result<Vec<u8>> {
        self.seal(PayloadKind::Metadata, metadata)
    }

    fn decode_metadata(&self, bytes: &[u8]) -> Result<Metadata> {
        self.open(PayloadKind::Metadata, bytes)
    }
}

// ── Column encoding ──────────────────────────────────────────────────

fn encode_column(column: &Column) -> WireColumn {
    fn encode_cells<T>(values: &[Option<T>], f: impl Fn(&T) -> Value) -> Vec<Value> {
        values
            .iter()
            .map(|v| v.as_ref().map_or(Value::Null, &f))
            .collect()
    }

    let mut categories = None;
    let values = match &column.data {
        ColumnData::Int64(v) => encode_cells(v, |x| Value::from(*x)),
        ColumnData::Float64(v) => encode_cells(v, |x| float_to_json(*x)),
        ColumnData::Utf8(v) => encode_cells(v, |x| Value::from(x.as_str())),
        ColumnData::Bool(v) => encode_cells(v, |x| Value::from(*x)),
        ColumnData::Timestamp(v) => {
            encode_cells(v, |x| Value::from(x.to_rfc3339_opts(SecondsFormat::Nanos, true)))
        }
        ColumnData::Duration(v) => encode_cells(v, |x| {
            Value::from(vec![x.num_seconds(), i64::from(x.subsec_nanos())])
        }),
        ColumnData::Categorical {
            categories: labels,
            codes,
        } => {
            categories = Some(labels.clone());
            encode_cells(codes, |x| Value::from(*x))
        }
    };

    WireColumn {
        name: column.name.clone(),
        dtype: column.dtype().as_str().to_string(),
        categories,
        values,
    }
}

fn float_to_json(x: f64) -> Value {
    if x.is_nan() {
        Value::from("NaN")
    } else if x.is_infinite() {
        Value::from(if x > 0.0 { "inf" } else { "-inf" })
    } else {
        serde_json::Number::from_f64(x).map_or(Value::Null, Value::Number)
    }
}

// ── Column restoration ───────────────────────────────────────────────

/// Restore one column to its tagged type. A column whose cells do not fit
/// the tag comes back as text so the rest of the frame stays usable.
fn restore_column(wire: WireColumn) -> Column {
    match restore_data(&wire) {
        Ok(data) => Column::new(wire.name, data),
        Err(reason) => {
            warn!(
                column = %wire.name,
                dtype = %wire.dtype,
                %reason,
                "column type restoration failed, falling back to text"
            );
            let text = wire.values.iter().map(value_as_text).collect();
            Column::new(wire.name, ColumnData::Utf8(text))
        }
    }
}

fn restore_data(wire: &WireColumn) -> std::result::Result<ColumnData, String> {
    let dtype: DType = wire.dtype.parse()?;
    let values = &wire.values;
    let data = match dtype {
        DType::Int64 => ColumnData::Int64(cells(values, "integer", Value::as_i64)?),
        DType::Float64 => ColumnData::Float64(cells(values, "float", float_from_json)?),
        DType::Utf8 => ColumnData::Utf8(cells(values, "string", |v| {
            v.as_str().map(str::to_string)
        })?),
        DType::Bool => ColumnData::Bool(cells(values, "boolean", Value::as_bool)?),
        DType::Timestamp => ColumnData::Timestamp(cells(values, "timestamp", |v| {
            v.as_str().and_then(parse_timestamp)
        })?),
        DType::Duration => ColumnData::Duration(cells(values, "duration", duration_from_json)?),
        DType::Categorical => {
            let categories = wire
                .categories
                .clone()
                .ok_or_else(|| "categorical column without categories".to_string())?;
            let codes = cells(values, "category code", |v| {
                v.as_u64()
                    .and_then(|c| u32::try_from(c).ok())
                    .filter(|c| (*c as usize) < categories.len())
            })?;
            let data = ColumnData::Categorical { categories, codes };
            data.check_codes()?;
            data
        }
    };
    Ok(data)
}

fn cells<T>(
    values: &[Value],
    expected: &str,
    parse: impl Fn(&Value) -> Option<T>,
) -> std::result::Result<Vec<Option<T>>, String> {
    values
        .iter()
        .enumerate()
        .map(|(row, value)| {
            if value.is_null() {
                return Ok(None);
            }
            parse(value)
                .map(Some)
                .ok_or_else(|| format!("row {row}: expected {expected}, found {value}"))
        })
        .collect()
}

fn float_from_json(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" | "nan" => Some(f64::NAN),
            "inf" | "+inf" | "Infinity" => Some(f64::INFINITY),
            "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// `[seconds, subsec_nanos]`, or a bare nanosecond count.
fn duration_from_json(value: &Value) -> Option<TimeDelta> {
    match value {
        Value::Array(parts) => match parts.as_slice() {
            [secs, nanos] => TimeDelta::try_seconds(secs.as_i64()?)?
                .checked_add(&TimeDelta::nanoseconds(nanos.as_i64()?)),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(TimeDelta::nanoseconds),
        _ => None,
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn pack(envelope: &Value) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(envelope.to_string().as_bytes())
            .unwrap();
        encoder.finish().unwrap()
    }

    fn every_type() -> DataFrame {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 13, 45, 7).unwrap()
            + TimeDelta::nanoseconds(123_456_789);
        DataFrame::new(vec![
            Column::new("int", ColumnData::Int64(vec![Some(i64::MIN), None, Some(42)])),
            Column::new(
                "float",
                ColumnData::Float64(vec![Some(f64::NAN), Some(-0.1), Some(f64::NEG_INFINITY)]),
            ),
            Column::new(
                "text",
                ColumnData::Utf8(vec![Some("héllo, \"world\"".into()), Some(String::new()), None]),
            ),
            Column::new("bool", ColumnData::Bool(vec![Some(true), None, Some(false)])),
            Column::new(
                "ts",
                ColumnData::Timestamp(vec![Some(ts), None, Some(DateTime::UNIX_EPOCH)]),
            ),
            Column::new(
                "dur",
                ColumnData::Duration(vec![
                    Some(TimeDelta::milliseconds(-1_500)),
                    Some(TimeDelta::nanoseconds(7)),
                    None,
                ]),
            ),
            Column::new(
                "cat",
                ColumnData::categorical_from_labels(vec![Some("red"), None, Some("red")]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn roundtrips_every_column_type() {
        let codec = JsonCodec::default();
        let frame = every_type();
        let decoded = codec.decode_frame(&codec.encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.column_names(), frame.column_names());
    }

    #[test]
    fn reencode_is_byte_identical() {
        let codec = JsonCodec::default();
        let first = codec.encode_frame(&every_type()).unwrap();
        let second = codec
            .encode_frame(&codec.decode_frame(&first).unwrap())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn every_compression_level_decodes() {
        let frame = every_type();
        for level in 1..=9 {
            let codec = JsonCodec::new(level).unwrap();
            let bytes = codec.encode_frame(&frame).unwrap();
            assert_eq!(codec.decode_frame(&bytes).unwrap(), frame, "level {level}");
        }
        assert!(JsonCodec::new(0).is_err());
    }

    #[test]
    fn empty_frame_roundtrips() {
        let codec = JsonCodec::default();
        let bytes = codec.encode_frame(&DataFrame::empty()).unwrap();
        assert_eq!(codec.decode_frame(&bytes).unwrap(), DataFrame::empty());
    }

    #[test]
    fn rejects_arbitrary_bytes() {
        let codec = JsonCodec::default();
        let cases: [&[u8]; 3] = [b"", b"\x80\x04\x95 not a pickle", b"{\"format\":\"dp-session\"}"];
        for garbage in cases {
            let err = codec.decode_frame(garbage).unwrap_err();
            assert!(matches!(err, Error::Serialization(_)), "{err}");
        }
    }

    #[test]
    fn rejects_compressed_non_json() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"import os; os.system('x')").unwrap();
        let bytes = encoder.finish().unwrap();
        assert!(matches!(
            JsonCodec::default().decode_frame(&bytes),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn rejects_foreign_envelopes() {
        let codec = JsonCodec::default();
        let body = json!({ "rows": 0, "columns": [], "data": [] });
        let cases = [
            json!({ "format": "other", "version": 1, "kind": "frame", "body": body }),
            json!({ "format": "dp-session", "version": 2, "kind": "frame", "body": body }),
            json!({
                "format": "dp-session", "version": 1, "kind": "frame", "body": body, "extra": 1
            }),
            json!({ "format": "dp-session", "version": 1, "kind": "object", "body": body }),
        ];
        for envelope in cases {
            assert!(codec.decode_frame(&pack(&envelope)).is_err(), "{envelope}");
        }
    }

    #[test]
    fn rejects_shape_mismatch() {
        let envelope = json!({
            "format": "dp-session", "version": 1, "kind": "frame",
            "body": { "rows": 3, "columns": ["a"], "data": [
                { "name": "a", "dtype": "int64", "values": [1, 2] }
            ]}
        });
        assert!(JsonCodec::default().decode_frame(&pack(&envelope)).is_err());
    }

    #[test]
    fn frame_and_metadata_payloads_are_not_interchangeable() {
        let codec = JsonCodec::default();
        let frame_bytes = codec.encode_frame(&every_type()).unwrap();
        assert!(codec.decode_metadata(&frame_bytes).is_err());

        let mut meta = Metadata::new();
        meta.insert("step".into(), json!(3));
        let meta_bytes = codec.encode_metadata(&meta).unwrap();
        assert!(codec.decode_frame(&meta_bytes).is_err());
        assert_eq!(codec.decode_metadata(&meta_bytes).unwrap(), meta);
    }

    #[test]
    fn naive_timestamps_are_restored_as_utc() {
        let envelope = json!({
            "format": "dp-session", "version": 1, "kind": "frame",
            "body": { "rows": 3, "columns": ["when"], "data": [
                { "name": "when", "dtype": "timestamp",
                  "values": ["2024-01-02 03:04:05.5", "2024-01-02", null] }
            ]}
        });
        let frame = JsonCodec::default().decode_frame(&pack(&envelope)).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + TimeDelta::milliseconds(500);
        match &frame.column("when").unwrap().data {
            ColumnData::Timestamp(values) => {
                assert_eq!(values[0], Some(expected));
                assert_eq!(values[1], Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
                assert_eq!(values[2], None);
            }
            other => panic!("expected timestamps, got {:?}", other.dtype()),
        }
    }

    #[test]
    fn unrestorable_column_falls_back_to_text() {
        let envelope = json!({
            "format": "dp-session", "version": 1, "kind": "frame",
            "body": { "rows": 2, "columns": ["id", "when", "kind"], "data": [
                { "name": "id", "dtype": "int64", "values": [1, 2] },
                { "name": "when", "dtype": "timestamp", "values": ["last tuesday", 17] },
                { "name": "kind", "dtype": "tensor", "values": ["a", null] }
            ]}
        });
        let frame = JsonCodec::default().decode_frame(&pack(&envelope)).unwrap();
        assert_eq!(frame.column("id").unwrap().dtype(), DType::Int64);
        assert_eq!(
            frame.column("when").unwrap().data,
            ColumnData::Utf8(vec![Some("last tuesday".into()), Some("17".into())])
        );
        assert_eq!(
            frame.column("kind").unwrap().data,
            ColumnData::Utf8(vec![Some("a".into()), None])
        );
    }

    #[test]
    fn duplicate_categories_fall_back_to_text() {
        let envelope = json!({
            "format": "dp-session", "version": 1, "kind": "frame",
            "body": { "rows": 1, "columns": ["id", "c"], "data": [
                { "name": "id", "dtype": "int64", "values": [1] },
                { "name": "c", "dtype": "categorical", "categories": ["a", "a"], "values": [0] }
            ]}
        });
        let frame = JsonCodec::default().decode_frame(&pack(&envelope)).unwrap();
        assert_eq!(frame.shape(), dp_core::Shape::new(1, 2));
        assert_eq!(frame.column("id").unwrap().data, ColumnData::Int64(vec![Some(1)]));
        assert_eq!(
            frame.column("c").unwrap().data,
            ColumnData::Utf8(vec![Some("0".into())])
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let codec = JsonCodec::default();
        let bytes = codec.encode_frame(&every_type()).unwrap();
        let tight = JsonCodec::default().with_max_payload_bytes(16);
        assert!(matches!(tight.decode_frame(&bytes), Err(Error::Serialization(_))));
    }

    #[test]
    fn records_roundtrip_through_metadata() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Record {
            name: String,
            steps: Vec<u64>,
        }
        let codec = JsonCodec::default();
        let record = Record {
            name: "fill_na".into(),
            steps: vec![1, 2],
        };
        let bytes = encode_record(&codec, &record).unwrap();
        assert_eq!(decode_record::<Record>(&codec, &bytes).unwrap(), record);
        assert!(encode_record(&codec, &vec![1, 2]).is_err());
    }
}
