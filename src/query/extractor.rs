//! Value extraction.
//!
//! A [`ValueExtractor`] pulls a single [`Field`] out of a serialized entry. Its
//! [`ValueExtractor::canonical_name`] is its identity: indexes are registered and looked up by it, so
//! two extractors sharing a canonical name are expected to extract exactly the same thing.
use std::{cmp::Ordering, fmt::Debug};

use serde_json::Value;

use crate::error::{Error, Result};

/// A value extracted from an entry.
///
/// Numbers compare numerically regardless of being [`Field::Int`] or [`Field::Float`]. Values of
/// different kinds (eg: a number and a string) are still totally ordered (by kind first) so they can
/// live in the same index, but comparison filters never match across kinds
/// (see [`Field::comparable_with`]).
#[derive(Clone, Debug)]
pub enum Field {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Field>),
}

impl Field {
    fn kind(&self) -> u8 {
        match self {
            Field::Null => 0,
            Field::Bool(_) => 1,
            Field::Int(_) | Field::Float(_) => 2,
            Field::Str(_) => 3,
            Field::List(_) => 4,
        }
    }

    /// True if both fields are of the same kind and can be meaningfully compared
    pub fn comparable_with(&self, other: &Field) -> bool {
        self.kind() == other.kind()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }
}

/// Float ordering used by [`Field`]: `-0.0` equals `0.0` and every NaN equals every other NaN,
/// sorting above all numbers.
fn cmp_floats(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison between an integer and a float.
fn cmp_int_float(int: i64, float: f64) -> Ordering {
    // 2^63, the first float above i64::MAX
    const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;
    if float.is_nan() || float >= I64_UPPER {
        return Ordering::Less;
    }
    if float < -I64_UPPER {
        return Ordering::Greater;
    }

    let truncated = float.trunc();
    match int.cmp(&(truncated as i64)) {
        Ordering::Equal => {
            if float > truncated {
                Ordering::Less
            } else if float < truncated {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ordering => ordering,
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Field::Null, Field::Null) => Ordering::Equal,
            (Field::Bool(a), Field::Bool(b)) => a.cmp(b),
            (Field::Int(a), Field::Int(b)) => a.cmp(b),
            (Field::Float(a), Field::Float(b)) => cmp_floats(*a, *b),
            (Field::Int(a), Field::Float(b)) => cmp_int_float(*a, *b),
            (Field::Float(a), Field::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Field::Str(a), Field::Str(b)) => a.cmp(b),
            (Field::List(a), Field::List(b)) => a.cmp(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Field {}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Str(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Str(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::Int(v)
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Float(v)
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Field::Bool(v)
    }
}

impl TryFrom<&Value> for Field {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Field::Null,
            Value::Bool(b) => Field::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Field::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Field::Float(f)
                } else {
                    return Err(Error::Generic {
                        reason: format!("Unable to represent number {}", n),
                    });
                }
            }
            Value::String(s) => Field::Str(s.clone()),
            Value::Array(items) => Field::List(
                items
                    .iter()
                    .map(Field::try_from)
                    .collect::<Result<Vec<Field>>>()?,
            ),
            Value::Object(_) => {
                return Err(Error::Generic {
                    reason: "Objects can't be extracted as a single field".to_string(),
                })
            }
        })
    }
}

/// Extracts a [`Field`] from a serialized entry.
pub trait ValueExtractor: Debug + Send + Sync {
    /// Identity of this extractor. Indexes are matched to filters through it.
    fn canonical_name(&self) -> &str;

    /// Extracts the field from the given serialized key and value
    fn extract(&self, key: &[u8], value: &[u8]) -> Result<Field>;
}

/// Extracts a field from JSON encoded values by following a dotted path (eg: `address.city`).
///
/// Numeric segments index into arrays (eg: `lines.0.sku`). A path that leads nowhere extracts
/// [`Field::Null`]. The empty path extracts the whole value.
#[derive(Clone, Debug)]
pub struct JsonPath {
    path: String,
    segments: Vec<String>,
}

impl JsonPath {
    pub fn new(path: &str) -> Self {
        let segments = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').map(str::to_string).collect()
        };

        Self {
            path: path.to_string(),
            segments,
        }
    }
}

impl ValueExtractor for JsonPath {
    fn canonical_name(&self) -> &str {
        &self.path
    }

    fn extract(&self, _key: &[u8], value: &[u8]) -> Result<Field> {
        let document: Value = serde_json::from_slice(value)?;
        let mut current = Some(&document);
        for segment in self.segments.iter() {
            current = match current {
                Some(Value::Object(fields)) => fields.get(segment),
                Some(Value::Array(items)) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index)),
                _ => None,
            };
        }

        match current {
            Some(value) => Field::try_from(value),
            None => Ok(Field::Null),
        }
    }
}

/// An extractor backed by a plain function, for anything [`JsonPath`] can't express.
///
/// The canonical name is chosen by the caller. Picking a name already used by a different extractor
/// makes index lookups and scans disagree (see [`crate::error::Error::IndexMismatch`]).
#[derive(Clone, Debug)]
pub struct FnExtractor {
    name: String,
    f: fn(&[u8], &[u8]) -> Result<Field>,
}

impl FnExtractor {
    pub fn new(name: &str, f: fn(&[u8], &[u8]) -> Result<Field>) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl ValueExtractor for FnExtractor {
    fn canonical_name(&self) -> &str {
        &self.name
    }

    fn extract(&self, key: &[u8], value: &[u8]) -> Result<Field> {
        (self.f)(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Field, FnExtractor, JsonPath, ValueExtractor};
    use crate::error::Result;

    #[test]
    fn test_numbers_compare_numerically() {
        assert_eq!(Field::Int(5), Field::Float(5.0));
        assert!(Field::Int(5) < Field::Float(5.5));
        assert!(Field::Float(4.9) < Field::Int(5));
        assert!(Field::Int(-3) > Field::Float(-3.5));
        assert!(Field::Int(i64::MAX) < Field::Float(1e19));
        assert!(Field::Int(i64::MIN) > Field::Float(-1e19));
    }

    #[test]
    fn test_signed_zeros_and_nan_order_consistently() {
        assert_eq!(Field::Float(-0.0), Field::Float(0.0));
        assert_eq!(Field::Int(0), Field::Float(-0.0));
        assert_eq!(Field::Float(f64::NAN), Field::Float(-f64::NAN));
        assert!(Field::Float(f64::INFINITY) < Field::Float(-f64::NAN));
        assert!(Field::Int(i64::MAX) < Field::Float(-f64::NAN));

        let mut zeros = std::collections::BTreeSet::new();
        zeros.insert(Field::Float(-0.0));
        zeros.insert(Field::Float(0.0));
        zeros.insert(Field::Int(0));
        assert_eq!(zeros.len(), 1);
    }

    #[test]
    fn test_kinds_are_ordered() {
        let mut fields = vec![
            Field::List(vec![]),
            Field::Str("a".to_string()),
            Field::Int(1),
            Field::Bool(true),
            Field::Null,
        ];
        fields.sort();
        assert!(fields[0].is_null());
        assert_eq!(fields[1], Field::Bool(true));
        assert!(!Field::Int(1).comparable_with(&Field::Str("1".to_string())));
        assert!(Field::Int(1).comparable_with(&Field::Float(1.0)));
    }

    #[test]
    fn test_json_path() {
        let value = br#"{"name":"ada","age":36,"address":{"city":"London"},"tags":["a","b"],"score":1.5}"#;
        let extract = |path: &str| JsonPath::new(path).extract(b"k", value).unwrap();

        assert_eq!(extract("name"), Field::from("ada"));
        assert_eq!(extract("age"), Field::Int(36));
        assert_eq!(extract("score"), Field::Float(1.5));
        assert_eq!(extract("address.city"), Field::from("London"));
        assert_eq!(extract("tags.1"), Field::from("b"));
        assert_eq!(
            extract("tags"),
            Field::List(vec![Field::from("a"), Field::from("b")])
        );
        assert!(extract("missing.path").is_null());
        assert!(extract("tags.7").is_null());
        assert_eq!(JsonPath::new("address.city").canonical_name(), "address.city");
    }

    #[test]
    fn test_json_path_failures() {
        assert!(JsonPath::new("a").extract(b"k", b"not json").is_err());
        assert!(JsonPath::new("address")
            .extract(b"k", br#"{"address":{"city":"x"}}"#)
            .is_err());
        assert_eq!(
            JsonPath::new("").extract(b"k", b"42").unwrap(),
            Field::Int(42)
        );
    }

    fn value_length(_key: &[u8], value: &[u8]) -> Result<Field> {
        Ok(Field::Int(value.len() as i64))
    }

    #[test]
    fn test_fn_extractor() {
        let extractor = FnExtractor::new("length()", value_length);
        assert_eq!(extractor.canonical_name(), "length()");
        assert_eq!(extractor.extract(b"k", b"abc").unwrap(), Field::Int(3));
    }
}
