//! Record and value encoding
//!
//! On-disk record: `{ts:u32 LE}{len:u32 LE}{payload}`. Numeric payloads are
//! the 8 little-endian bytes of the u64 or f64 bit pattern, strings are raw
//! UTF-8. [`StoreEngine::get`](super::StoreEngine::get) hands back
//! `{ts:u32 LE}{payload}` rows which [`decode_row`] turns into points.

use crate::{CounterId, DataPoint, DataType, ReportError, Result, Timestamp, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Timestamp + payload length
pub const RECORD_HEADER_LEN: usize = 8;

/// Encode a value as the payload for its counter's declared type
pub fn encode_value(counter_id: CounterId, data_type: DataType, value: &Value) -> Result<Bytes> {
    let mismatch = || ReportError::TypeMismatch {
        counter_id,
        expected: data_type.name(),
    };
    match (data_type, value) {
        (DataType::Uint64, Value::U64(v)) => Ok(Bytes::copy_from_slice(&v.to_le_bytes())),
        (DataType::Float64, Value::F64(v)) => {
            Ok(Bytes::copy_from_slice(&v.to_bits().to_le_bytes()))
        }
        (DataType::String, Value::Str(s)) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        _ => Err(mismatch()),
    }
}

/// Frame a payload as an on-disk record
pub fn encode_record(timestamp: Timestamp, payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ReportError::Decode(format!("payload of {} bytes too large", payload.len())))?;
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len());
    buf.put_u32_le(timestamp);
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build a `{ts}{payload}` row as returned by the engine
pub fn row(timestamp: Timestamp, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(timestamp);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a `{ts}{payload}` row by the counter's declared type
pub fn decode_row(mut data: &[u8], data_type: DataType) -> Result<DataPoint> {
    if data.len() < 4 {
        return Err(ReportError::Decode(format!("row of {} bytes has no timestamp", data.len())));
    }
    let timestamp = data.get_u32_le();
    let value = match data_type {
        DataType::Uint64 | DataType::Float64 => {
            if data.len() != 8 {
                return Err(ReportError::Decode(format!(
                    "{} payload must be 8 bytes, got {}",
                    data_type,
                    data.len()
                )));
            }
            let bits = data.get_u64_le();
            if data_type == DataType::Uint64 {
                Value::U64(bits)
            } else {
                Value::F64(f64::from_bits(bits))
            }
        }
        DataType::String => Value::Str(
            std::str::from_utf8(data)
                .map_err(|e| ReportError::Decode(e.to_string()))?
                .to_string(),
        ),
    };
    Ok(DataPoint { timestamp, value })
}

/// Decode a batch of rows, skipping (and counting) undecodable ones
pub fn decode_rows(rows: &[Bytes], data_type: DataType) -> (Vec<DataPoint>, usize) {
    let mut points = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for r in rows {
        match decode_row(r, data_type) {
            Ok(point) => points.push(point),
            Err(e) => {
                skipped += 1;
                tracing::warn!(error = %e, "skipping undecodable record");
            }
        }
    }
    (points, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored_row(ts: Timestamp, data_type: DataType, value: Value) -> DataPoint {
        let payload = encode_value(1, data_type, &value).unwrap();
        let record = encode_record(ts, &payload).unwrap();
        // What the engine reads back: header length field stripped
        let len = u32::from_le_bytes(record[4..8].try_into().unwrap()) as usize;
        assert_eq!(len, payload.len());
        decode_row(&row(ts, &record[8..]), data_type).unwrap()
    }

    #[test]
    fn test_round_trip_each_type() {
        assert_eq!(
            stored_row(100, DataType::Uint64, Value::U64(u64::MAX)),
            DataPoint::new(100, u64::MAX)
        );
        assert_eq!(
            stored_row(101, DataType::Float64, Value::F64(-0.125)),
            DataPoint::new(101, -0.125)
        );
        assert_eq!(
            stored_row(102, DataType::String, Value::from("eth0 up")),
            DataPoint::new(102, "eth0 up")
        );
        assert_eq!(
            stored_row(103, DataType::String, Value::from("")),
            DataPoint::new(103, "")
        );
    }

    #[test]
    fn test_record_layout() {
        let record = encode_record(0x01020304, &[9, 9]).unwrap();
        assert_eq!(&record[..], &[4, 3, 2, 1, 2, 0, 0, 0, 9, 9]);
    }

    #[test]
    fn test_type_mismatch() {
        let err = encode_value(7, DataType::Float64, &Value::U64(1)).unwrap_err();
        assert!(matches!(
            err,
            ReportError::TypeMismatch { counter_id: 7, expected: "float64" }
        ));
        assert!(encode_value(7, DataType::Uint64, &Value::from("x")).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_rows() {
        assert!(decode_row(&[1, 2], DataType::Uint64).is_err());
        assert!(decode_row(&[0, 0, 0, 0, 1, 2, 3], DataType::Float64).is_err());

        let (points, skipped) = decode_rows(
            &[row(1, &5u64.to_le_bytes()), Bytes::from_static(&[1])],
            DataType::Uint64,
        );
        assert_eq!(points, vec![DataPoint::new(1, 5u64)]);
        assert_eq!(skipped, 1);
    }
}
