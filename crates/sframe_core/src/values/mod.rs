//! Dynamically typed scalar values.
//!
//! Every cell in a column is a [`Value`]. Values carry their own type tag
//! and provide the strict total ordering and hashing that sort and groupby
//! keys rely on.

pub mod encoding;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use sframe_error::{Result, SframeError};

/// Declared element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Integer,
    Float,
    String,
    Vector,
    List,
    Dict,
    DateTime,
    Image,
    NdArray,
    Undefined,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Vector => "vector",
            ValueType::List => "list",
            ValueType::Dict => "dict",
            ValueType::DateTime => "datetime",
            ValueType::Image => "image",
            ValueType::NdArray => "ndarray",
            ValueType::Undefined => "undefined",
        }
    }

    pub fn parse(s: &str) -> Result<ValueType> {
        Ok(match s {
            "integer" => ValueType::Integer,
            "float" => ValueType::Float,
            "string" => ValueType::String,
            "vector" => ValueType::Vector,
            "list" => ValueType::List,
            "dict" => ValueType::Dict,
            "datetime" => ValueType::DateTime,
            "image" => ValueType::Image,
            "ndarray" => ValueType::NdArray,
            "undefined" => ValueType::Undefined,
            other => return Err(SframeError::new(format!("Unknown value type '{other}'"))),
        })
    }

    /// Types whose values have a small fixed in-memory footprint.
    ///
    /// Used by the sort path selection heuristic.
    pub const fn is_definitely_small(&self) -> bool {
        matches!(
            self,
            ValueType::Integer | ValueType::Float | ValueType::DateTime
        )
    }

    /// Whether both types are numeric (integer or float).
    pub const fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Float)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A point in time with timezone offset (in 15 minute increments) and
/// sub-second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateTimeValue {
    pub posix: i64,
    pub tz_offset_15min: i32,
    pub microsecond: u32,
}

/// Opaque decoded image payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageValue {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Format discriminant, opaque to the engine.
    pub format: u8,
    pub data: Vec<u8>,
}

/// Dense n-dimensional array of doubles.
#[derive(Debug, Clone)]
pub struct NdArrayValue {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

/// A dynamically typed scalar.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Integer(i64),
    Float(f64),
    String(String),
    Vector(Vec<f64>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    DateTime(DateTimeValue),
    Image(ImageValue),
    NdArray(NdArrayValue),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Undefined => ValueType::Undefined,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Vector(_) => ValueType::Vector,
            Value::List(_) => ValueType::List,
            Value::Dict(_) => ValueType::Dict,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Image(_) => ValueType::Image,
            Value::NdArray(_) => ValueType::NdArray,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value, if it is integer or float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit hash of the value with a fixed seed.
    pub fn hash64(&self) -> u64 {
        let mut hasher = ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
        .build_hasher();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// 128-bit hash, formed from two independently seeded 64-bit hashes.
    pub fn hash128(&self) -> u128 {
        let mut hasher = ahash::RandomState::with_seeds(
            0x4528_21e6_38d0_1377,
            0xbe54_66cf_34e9_0c6c,
            0xc0ac_29b7_c97c_50dd,
            0x3f84_d5b5_b547_0917,
        )
        .build_hasher();
        self.hash(&mut hasher);
        ((self.hash64() as u128) << 64) | (hasher.finish() as u128)
    }
}

/// Hasher state for ahash maps and sets. Built from fixed seeds since
/// the crate disables ahash's runtime rng.
pub fn map_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        0x9e37_79b9_7f4a_7c15,
        0xf39c_c060_5ced_c834,
        0x1082_276b_f3a2_7251,
        0x8864_2e68_3c89_c529,
    )
}

// Rank used when comparing values of different type tags. Integer and
// float share a rank so that cross-numeric comparisons are numeric.
fn type_rank(t: ValueType) -> u8 {
    match t {
        ValueType::Undefined => 0,
        ValueType::Integer | ValueType::Float => 1,
        ValueType::String => 2,
        ValueType::Vector => 3,
        ValueType::List => 4,
        ValueType::Dict => 5,
        ValueType::DateTime => 6,
        ValueType::Image => 7,
        ValueType::NdArray => 8,
    }
}

fn cmp_f64_slices(a: &[f64], b: &[f64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.total_cmp(y) {
            Ordering::Equal => {}
            non_eq => return non_eq,
        }
    }
    a.len().cmp(&b.len())
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_ord = type_rank(self.value_type()).cmp(&type_rank(other.value_type()));
        if rank_ord != Ordering::Equal {
            return rank_ord;
        }

        match (self, other) {
            (Value::Undefined, Value::Undefined) => Ordering::Equal,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            // Mixed numeric comparisons are numeric, matching the dynamic
            // value semantics columns were written with. NaN sorts above
            // all other floats via the IEEE total order.
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Vector(a), Value::Vector(b)) => cmp_f64_slices(a, b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Dict(a), Value::Dict(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => (a.posix, a.microsecond, a.tz_offset_15min)
                .cmp(&(b.posix, b.microsecond, b.tz_offset_15min)),
            (Value::Image(a), Value::Image(b)) => (
                a.width, a.height, a.channels, a.format, &a.data,
            )
                .cmp(&(b.width, b.height, b.channels, b.format, &b.data)),
            (Value::NdArray(a), Value::NdArray(b)) => a
                .shape
                .cmp(&b.shape)
                .then_with(|| cmp_f64_slices(&a.data, &b.data)),
            _ => unreachable!("type ranks matched but variants did not"),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialEq for NdArrayValue {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && cmp_f64_slices(&self.data, &other.data) == Ordering::Equal
    }
}

impl Eq for NdArrayValue {}

impl PartialOrd for NdArrayValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NdArrayValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.shape
            .cmp(&other.shape)
            .then_with(|| cmp_f64_slices(&self.data, &other.data))
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash must agree with Eq: a float that holds an exact integer
        // hashes identically to that integer.
        match self {
            Value::Undefined => state.write_u8(0),
            Value::Integer(v) => {
                state.write_u8(1);
                state.write_i64(*v);
            }
            Value::Float(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    state.write_u8(1);
                    state.write_i64(*v as i64);
                } else {
                    state.write_u8(2);
                    state.write_u64(v.to_bits());
                }
            }
            Value::String(v) => {
                state.write_u8(3);
                v.hash(state);
            }
            Value::Vector(v) => {
                state.write_u8(4);
                state.write_usize(v.len());
                for f in v {
                    state.write_u64(f.to_bits());
                }
            }
            Value::List(v) => {
                state.write_u8(5);
                state.write_usize(v.len());
                for item in v {
                    item.hash(state);
                }
            }
            Value::Dict(v) => {
                state.write_u8(6);
                state.write_usize(v.len());
                for (k, val) in v {
                    k.hash(state);
                    val.hash(state);
                }
            }
            Value::DateTime(v) => {
                state.write_u8(7);
                v.hash(state);
            }
            Value::Image(v) => {
                state.write_u8(8);
                v.hash(state);
            }
            Value::NdArray(v) => {
                state.write_u8(9);
                v.shape.hash(state);
                state.write_usize(v.data.len());
                for f in &v.data {
                    state.write_u64(f.to_bits());
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("None"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Vector(v) => write!(f, "{v:?}"),
            Value::List(v) => {
                f.write_str("[")?;
                for (idx, item) in v.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Dict(v) => {
                f.write_str("{")?;
                for (idx, (k, val)) in v.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {val}")?;
                }
                f.write_str("}")
            }
            Value::DateTime(v) => write!(f, "datetime({}.{:06})", v.posix, v.microsecond),
            Value::Image(v) => write!(f, "image({}x{})", v.width, v.height),
            Value::NdArray(v) => write!(f, "ndarray(shape={:?})", v.shape),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_sorts_first() {
        assert!(Value::Undefined < Value::Integer(i64::MIN));
        assert!(Value::Undefined < Value::String(String::new()));
        assert_eq!(Value::Undefined, Value::Undefined);
    }

    #[test]
    fn cross_numeric_compare() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert!(Value::Integer(3) < Value::Float(3.5));
        assert!(Value::Float(2.5) < Value::Integer(3));
    }

    #[test]
    fn nan_sorts_above_floats() {
        assert!(Value::Float(f64::NAN) > Value::Float(f64::INFINITY));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn hash_consistent_with_eq() {
        assert_eq!(Value::Integer(3).hash64(), Value::Float(3.0).hash64());
        assert_ne!(Value::Integer(3).hash64(), Value::Float(3.5).hash64());
    }

    #[test]
    fn vector_lexicographic() {
        let a = Value::Vector(vec![1.0, 2.0]);
        let b = Value::Vector(vec![1.0, 2.0, 0.0]);
        assert!(a < b);
    }

    #[test]
    fn hash128_distinct_halves() {
        let h = Value::String("abc".into()).hash128();
        assert_ne!((h >> 64) as u64, h as u64);
    }

    #[test]
    fn map_state_is_reproducible() {
        use std::hash::BuildHasher;
        let a = map_state().hash_one("key");
        let b = map_state().hash_one("key");
        assert_eq!(a, b);
    }
}
