//! Concrete values and argument bundles carried by mails and task calls.
//!
//! Anything that may cross a station boundary must be expressible as a
//! [`Value`]; the closed set of container cases below is also exactly the set
//! the placeholder substitution visitor descends into.

use std::collections::{BTreeMap, BTreeSet};
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A self-describing wire value.
///
/// Equality and ordering are total: floats compare by [`f64::total_cmp`] so
/// values can be members of sets and keys cannot poison a map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// The unit value; also what argument-less results collapse to.
    Unit,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered, growable sequence.
    List(Vec<Value>),
    /// Ordered, fixed-shape sequence.
    Tuple(Vec<Value>),
    /// Unordered unique collection.
    Set(BTreeSet<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Unit => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::List(_) => 6,
            Value::Tuple(_) => 7,
            Value::Set(_) => 8,
            Value::Map(_) => 9,
        }
    }

    /// The string payload, when this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, when this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Unit, Unit) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (List(a), List(b)) | (Tuple(a), Tuple(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.cmp(b),
            (Map(a), Map(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Positional and keyword arguments for one instruction or task call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    /// Positional arguments, in call order.
    pub pos: Vec<Value>,
    /// Keyword arguments.
    pub kw: BTreeMap<String, Value>,
}

impl Args {
    /// An empty bundle.
    pub fn new() -> Self {
        Args::default()
    }

    /// A bundle of positional arguments only.
    pub fn positional<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Args {
            pos: values.into_iter().collect(),
            kw: BTreeMap::new(),
        }
    }

    /// Adds one keyword argument, builder-style.
    pub fn with_kw(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kw.insert(key.into(), value);
        self
    }

    /// The `index`-th positional argument.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.pos.get(index)
    }

    /// The keyword argument named `key`.
    pub fn keyword(&self, key: &str) -> Option<&Value> {
        self.kw.get(key)
    }

    /// True when no argument was bound.
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty() && self.kw.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_ordering_is_total() {
        let mut set = BTreeSet::new();
        set.insert(Value::Float(f64::NAN));
        set.insert(Value::Float(1.0));
        set.insert(Value::Float(f64::NAN));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn cross_variant_ordering_is_stable() {
        let mut values = vec![Value::Str("a".into()), Value::Int(3), Value::Unit];
        values.sort();
        assert_eq!(
            values,
            vec![Value::Unit, Value::Int(3), Value::Str("a".into())]
        );
    }
}
