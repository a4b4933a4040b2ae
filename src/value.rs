//! Heterogeneous call arguments consumed by parameter rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A call argument as seen by hot-key rules. Hashing and equality of this
/// type drive the per-value counter maps, so floats are carried as raw bits
/// and opaque application keys must already be stringified by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    /// IEEE-754 bits of an `f64`.
    FloatBits(u64),
    Str(String),
    /// Checked element-wise; the first failing element rejects the call.
    Seq(Vec<ParamValue>),
    /// Caller-provided stable key for values with no natural encoding.
    Opaque(String),
}

impl ParamValue {
    pub fn float(value: f64) -> Self {
        Self::FloatBits(value.to_bits())
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::FloatBits(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Elements to check individually, if this value is a sequence.
    pub fn elements(&self) -> Option<&[ParamValue]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::FloatBits(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Str(v) => f.write_str(v),
            Self::Seq(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Opaque(key) => f.write_str(key),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn float_bits_are_stable_map_keys() {
        let mut counters: HashMap<ParamValue, u32> = HashMap::new();
        *counters.entry(ParamValue::float(1.5)).or_default() += 1;
        *counters.entry(ParamValue::float(1.5)).or_default() += 1;
        assert_eq!(counters[&ParamValue::float(1.5)], 2);
    }

    #[test]
    fn display_is_caller_friendly() {
        let seq = ParamValue::Seq(vec![ParamValue::Int(1), ParamValue::from("x")]);
        assert_eq!(seq.to_string(), "[1, x]");
    }
}
