pub mod array;
pub mod scalar;
pub mod shared_buffer;
pub mod wire;

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;

use dagflow_error::{DbError, Result};
use siphasher::sip::SipHasher24;

pub use self::array::{ArrayValue, GrowableArray};
pub use self::scalar::ScalarValue;

/// A tagged runtime datum.
///
/// Values are independent of the compile-time schema. Arrays are cheap to
/// clone since they're views over a reference counted buffer, tuples own their
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    None,
    Atomic(ScalarValue),
    Array(ArrayValue),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn int64(v: i64) -> Self {
        Value::Atomic(ScalarValue::Int64(v))
    }

    pub fn uint64(v: u64) -> Self {
        Value::Atomic(ScalarValue::UInt64(v))
    }

    pub fn float64(v: f64) -> Self {
        Value::Atomic(ScalarValue::Float64(v))
    }

    pub fn boolean(v: bool) -> Self {
        Value::Atomic(ScalarValue::Boolean(v))
    }

    pub fn utf8(v: impl Into<String>) -> Self {
        Value::Atomic(ScalarValue::Utf8(v.into()))
    }

    pub fn tuple(fields: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(fields.into_iter().collect())
    }

    pub fn array(values: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(ArrayValue::from_values(values.into_iter().collect()))
    }

    /// Short name of the value's tag, used in error messages.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Atomic(_) => "atomic",
            Self::Array(_) => "array",
            Self::Tuple(_) => "tuple",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn try_as_scalar(&self) -> Result<&ScalarValue> {
        match self {
            Self::Atomic(s) => Ok(s),
            other => Err(unexpected_tag("atomic", other)),
        }
    }

    pub fn try_as_array(&self) -> Result<&ArrayValue> {
        match self {
            Self::Array(a) => Ok(a),
            other => Err(unexpected_tag("array", other)),
        }
    }

    pub fn try_as_tuple(&self) -> Result<&[Value]> {
        match self {
            Self::Tuple(fields) => Ok(fields),
            other => Err(unexpected_tag("tuple", other)),
        }
    }

    pub fn try_into_tuple(self) -> Result<Vec<Value>> {
        match self {
            Self::Tuple(fields) => Ok(fields),
            other => Err(unexpected_tag("tuple", &other)),
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        let scalar = self.try_as_scalar()?;
        scalar.try_as_i64().ok_or_else(|| {
            DbError::protocol("Expected an integer value").with_field("got", scalar.type_name())
        })
    }

    pub fn try_as_usize(&self) -> Result<usize> {
        let scalar = self.try_as_scalar()?;
        scalar.try_as_usize().ok_or_else(|| {
            DbError::protocol("Expected a non-negative integer value")
                .with_field("got", scalar.to_string())
        })
    }

    pub fn try_as_bool(&self) -> Result<bool> {
        let scalar = self.try_as_scalar()?;
        scalar.try_as_bool().ok_or_else(|| {
            DbError::protocol("Expected a boolean value").with_field("got", scalar.type_name())
        })
    }

    /// Get a field of a tuple value.
    pub fn field(&self, idx: usize) -> Result<&Value> {
        let fields = self.try_as_tuple()?;
        fields.get(idx).ok_or_else(|| {
            DbError::protocol("Tuple field out of range")
                .with_field("idx", idx)
                .with_field("num_fields", fields.len())
        })
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Atomic(_) => 1,
            Self::Array(_) => 2,
            Self::Tuple(_) => 3,
        }
    }
}

fn unexpected_tag(expected: &'static str, got: &Value) -> DbError {
    DbError::protocol(format!("Expected {expected} value"))
        .with_field("got", got.tag())
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order over values. Tuples and arrays compare lexicographically.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::None, Self::None) => Ordering::Equal,
            (Self::Atomic(a), Self::Atomic(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a
                .values()
                .cmp(b.values())
                .then_with(|| a.shape().cmp(b.shape())),
            (Self::Tuple(a), Self::Tuple(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Atomic(s) => write!(f, "{s}"),
            Self::Array(a) => {
                write!(f, "[")?;
                for (idx, v) in a.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Self::Tuple(fields) => {
                write!(f, "(")?;
                for (idx, v) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<ScalarValue> for Value {
    fn from(value: ScalarValue) -> Self {
        Value::Atomic(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::int64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::utf8(value)
    }
}

impl Value {
    /// SipHash-2-4 of the value's canonical byte encoding.
    ///
    /// Stable across platforms, builds and releases. Values that compare
    /// equal hash equal.
    pub fn stable_hash(&self, seed: u64) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(seed, 0);
        self.write_canonical(&mut hasher);
        hasher.finish()
    }

    fn write_canonical(&self, hasher: &mut SipHasher24) {
        let len = |hasher: &mut SipHasher24, n: usize| hasher.write(&(n as u64).to_le_bytes());
        match self {
            Value::None => hasher.write(&[0]),
            Value::Atomic(scalar) => {
                hasher.write(&[1]);
                match scalar {
                    ScalarValue::Boolean(v) => hasher.write(&[0, *v as u8]),
                    ScalarValue::Int64(v) => {
                        hasher.write(&[1]);
                        hasher.write(&v.to_le_bytes());
                    }
                    ScalarValue::UInt64(v) => {
                        hasher.write(&[2]);
                        hasher.write(&v.to_le_bytes());
                    }
                    ScalarValue::Float64(v) => {
                        hasher.write(&[3]);
                        hasher.write(&v.to_bits().to_le_bytes());
                    }
                    ScalarValue::Utf8(v) => {
                        hasher.write(&[4]);
                        len(hasher, v.len());
                        hasher.write(v.as_bytes());
                    }
                }
            }
            Value::Array(array) => {
                hasher.write(&[2]);
                len(hasher, array.shape().len());
                for &dim in array.shape() {
                    len(hasher, dim);
                }
                for value in array.values() {
                    value.write_canonical(hasher);
                }
            }
            Value::Tuple(fields) => {
                hasher.write(&[3]);
                len(hasher, fields.len());
                for field in fields {
                    field.write_canonical(hasher);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_nested() {
        let v = Value::tuple([
            Value::int64(1),
            Value::array([Value::utf8("a"), Value::utf8("b")]),
        ]);
        assert_eq!(r#"(1, ["a", "b"])"#, v.to_string());
    }

    #[test]
    fn tuple_ordering() {
        let a = Value::tuple([Value::int64(1), Value::int64(5)]);
        let b = Value::tuple([Value::int64(2), Value::int64(0)]);
        assert!(a < b);
    }

    #[test]
    fn field_access_errors() {
        let v = Value::int64(3);
        let err = v.field(0).unwrap_err();
        assert_eq!(dagflow_error::ErrorKind::ProtocolViolation, err.kind());

        let t = Value::tuple([Value::int64(3)]);
        assert_eq!(&Value::int64(3), t.field(0).unwrap());
        t.field(1).unwrap_err();
    }
}
