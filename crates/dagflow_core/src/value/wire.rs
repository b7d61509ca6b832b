use std::fmt::Debug;

use bytes::Bytes;
use dagflow_error::{DbError, Result, ResultExt};
use serde::{Deserialize, Serialize};

use super::{ArrayValue, ScalarValue, Value};

/// Self-describing form of a value used whenever a value crosses a pipeline
/// or process boundary.
///
/// Array views are compacted: only the visible elements travel, and the
/// receiving side gets a fresh buffer with offset zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum WireValue {
    None,
    Boolean(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Utf8(String),
    Array {
        shape: Vec<usize>,
        values: Vec<WireValue>,
    },
    Tuple(Vec<WireValue>),
}

impl From<&Value> for WireValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::None => WireValue::None,
            Value::Atomic(s) => match s {
                ScalarValue::Boolean(v) => WireValue::Boolean(*v),
                ScalarValue::Int64(v) => WireValue::Int64(*v),
                ScalarValue::UInt64(v) => WireValue::UInt64(*v),
                ScalarValue::Float64(v) => WireValue::Float64(*v),
                ScalarValue::Utf8(v) => WireValue::Utf8(v.clone()),
            },
            Value::Array(arr) => WireValue::Array {
                shape: arr.shape().to_vec(),
                values: arr.iter().map(WireValue::from).collect(),
            },
            Value::Tuple(fields) => WireValue::Tuple(fields.iter().map(WireValue::from).collect()),
        }
    }
}

impl WireValue {
    pub fn into_value(self) -> Result<Value> {
        Ok(match self {
            WireValue::None => Value::None,
            WireValue::Boolean(v) => Value::boolean(v),
            WireValue::Int64(v) => Value::int64(v),
            WireValue::UInt64(v) => Value::uint64(v),
            WireValue::Float64(v) => Value::float64(v),
            WireValue::Utf8(v) => Value::utf8(v),
            WireValue::Array { shape, values } => {
                let values = values
                    .into_iter()
                    .map(WireValue::into_value)
                    .collect::<Result<Vec<_>>>()?;
                Value::Array(ArrayValue::try_with_shape(values, shape)?)
            }
            WireValue::Tuple(fields) => Value::Tuple(
                fields
                    .into_iter()
                    .map(WireValue::into_value)
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

/// How a value is handed across an operator's output boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// Pass the in-process handle. Arrays stay views over shared buffers.
    InProcess,
    /// Convert to the wire form and back.
    Serialized,
}

/// Byte encoding for wire values.
pub trait WireCodec: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, values: &[WireValue]) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<WireValue>>;

    fn encode_values(&self, values: &[Value]) -> Result<Bytes> {
        let wire: Vec<_> = values.iter().map(WireValue::from).collect();
        self.encode(&wire)
    }

    fn decode_values(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        self.decode(bytes)?
            .into_iter()
            .map(WireValue::into_value)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWireCodec;

impl WireCodec for JsonWireCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, values: &[WireValue]) -> Result<Bytes> {
        let buf = serde_json::to_vec(values).context("Failed to encode wire values")?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<WireValue>> {
        serde_json::from_slice(bytes)
            .map_err(|e| DbError::protocol("Failed to decode wire values").with_field("error", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliced_array_is_compacted() {
        let arr = ArrayValue::from_values((0..6).map(Value::int64).collect());
        let view = Value::Array(arr.slice(4, 2).unwrap());

        let wire = WireValue::from(&view);
        assert_eq!(
            WireValue::Array {
                shape: vec![2],
                values: vec![WireValue::Int64(4), WireValue::Int64(5)],
            },
            wire
        );

        let back = wire.into_value().unwrap();
        assert_eq!(view, back);
        assert_eq!(0, back.try_as_array().unwrap().offset());
    }

    #[test]
    fn json_codec() {
        let values = vec![
            Value::tuple([Value::int64(1), Value::utf8("a"), Value::None]),
            Value::array([Value::float64(1.5)]),
        ];
        let codec = JsonWireCodec;
        let bytes = codec.encode_values(&values).unwrap();
        let decoded = codec.decode_values(&bytes).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn decode_garbage_is_protocol_error() {
        let err = JsonWireCodec.decode(b"not json").unwrap_err();
        assert_eq!(dagflow_error::ErrorKind::ProtocolViolation, err.kind());
    }
}
