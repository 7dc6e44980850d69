//! Dynamic SQL values.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A dynamically-typed SQL value.
///
/// Instance attributes, primary keys and statement parameters are all
/// carried as `Value`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Increment an integer version counter, keeping the integer width.
    pub fn next_version(&self) -> Option<Value> {
        match self {
            Value::TinyInt(v) => v.checked_add(1).map(Value::TinyInt),
            Value::SmallInt(v) => v.checked_add(1).map(Value::SmallInt),
            Value::Int(v) => v.checked_add(1).map(Value::Int),
            Value::BigInt(v) => v.checked_add(1).map(Value::BigInt),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Float(_)
            | Value::Double(_) => 2,
            Value::Decimal(_) | Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Date(_) => 5,
            Value::Time(_) => 6,
            Value::Timestamp(_) => 7,
            Value::Uuid(_) => 8,
            Value::Json(_) => 9,
        }
    }

    /// Total ordering used to sort rows by primary key.
    ///
    /// NULL sorts first. Integers of any width compare numerically with each
    /// other and with floats; values of unrelated types are grouped by kind.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) | (Value::Timestamp(a), Value::Timestamp(b)) => {
                a.cmp(b)
            }
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => match (self.numeric(), other.numeric()) {
                (Some(a), Some(b)) => a.compare(b),
                _ => match (self.as_str(), other.as_str()) {
                    (Some(a), Some(b)) => a.cmp(b),
                    _ => Ordering::Equal,
                },
            },
        }
    }

    fn numeric(&self) -> Option<Numeric> {
        match self {
            Value::Float(v) => Some(Numeric::Float(f64::from(*v))),
            Value::Double(v) => Some(Numeric::Float(*v)),
            other => other.as_i64().map(Numeric::Int),
        }
    }

    /// Feed a type-stable representation of this value into a hasher.
    ///
    /// Values that compare equal under [`sort_cmp`](Self::sort_cmp) hash
    /// identically: integers of any width, and floats holding a whole
    /// number, hash as that integer.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Float(_)
            | Value::Double(_) => match self.numeric().map(Numeric::normalized) {
                Some(Numeric::Int(i)) => {
                    2u8.hash(state);
                    i.hash(state);
                }
                Some(Numeric::Float(f)) => {
                    3u8.hash(state);
                    f.to_bits().hash(state);
                }
                None => {}
            },
            Value::Decimal(s) | Value::Text(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Value::Date(d) => {
                6u8.hash(state);
                d.hash(state);
            }
            Value::Time(t) => {
                7u8.hash(state);
                t.hash(state);
            }
            Value::Timestamp(t) => {
                8u8.hash(state);
                t.hash(state);
            }
            Value::Uuid(u) => {
                9u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                10u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

/// An integer or float column value, compared exactly across the two.
#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

/// 2^63, the first float above every `i64`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

impl Numeric {
    /// Whole floats within `i64` range become integers.
    fn normalized(self) -> Self {
        match self {
            #[allow(clippy::cast_possible_truncation)]
            Numeric::Float(f) if f.fract() == 0.0 && (-I64_LIMIT..I64_LIMIT).contains(&f) => {
                Numeric::Int(f as i64)
            }
            other => other,
        }
    }

    fn compare(self, other: Self) -> Ordering {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a.cmp(&b),
            (Numeric::Float(a), Numeric::Float(b)) => {
                a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
            }
            (Numeric::Int(i), Numeric::Float(f)) => cmp_int_float(i, f),
            (Numeric::Float(f), Numeric::Int(i)) => cmp_int_float(i, f).reverse(),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return (i as f64).total_cmp(&f);
    }
    if f >= I64_LIMIT {
        return Ordering::Less;
    }
    if f < -I64_LIMIT {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        ord => ord,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::TinyInt(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Date(v) => write!(f, "date:{v}"),
            Value::Time(v) => write!(f, "time:{v}"),
            Value::Timestamp(v) => write!(f, "ts:{v}"),
            Value::Uuid(u) => {
                for b in u {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

/// Compare two key tuples with [`Value::sort_cmp`].
pub fn cmp_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = x.sort_cmp(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}
