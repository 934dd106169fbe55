//! Filters over extracted fields.
use std::{collections::BTreeSet, ops::Bound, sync::Arc};

use bytes::Bytes;
use tracing::{event, Level};

use super::{
    extractor::{Field, ValueExtractor},
    index::IndexRegistry,
};

/// Shared handle to an extractor
pub type Extractor = Arc<dyn ValueExtractor>;

/// A predicate over the entries of a map.
///
/// Every leaf filter extracts a [`Field`] from the entry through its [`Extractor`]. If extraction fails,
/// the leaf does not match.
#[derive(Clone, Debug)]
pub enum Filter {
    Always,
    Never,
    Equals(Extractor, Field),
    NotEquals(Extractor, Field),
    Greater(Extractor, Field),
    GreaterEqual(Extractor, Field),
    Less(Extractor, Field),
    LessEqual(Extractor, Field),
    /// Inclusive on both ends
    Between {
        extractor: Extractor,
        lower: Field,
        upper: Field,
    },
    In(Extractor, Vec<Field>),
    /// The extracted value is a list containing the given element
    Contains(Extractor, Field),
    /// SQL like pattern matching on strings. `%` matches any sequence of characters, `_` exactly one.
    Like(Extractor, String),
    IsNull(Extractor),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn equals(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::Equals(extractor, value.into())
    }

    pub fn not_equals(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::NotEquals(extractor, value.into())
    }

    pub fn greater(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::Greater(extractor, value.into())
    }

    pub fn greater_equal(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::GreaterEqual(extractor, value.into())
    }

    pub fn less(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::Less(extractor, value.into())
    }

    pub fn less_equal(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::LessEqual(extractor, value.into())
    }

    pub fn between(extractor: Extractor, lower: impl Into<Field>, upper: impl Into<Field>) -> Self {
        Filter::Between {
            extractor,
            lower: lower.into(),
            upper: upper.into(),
        }
    }

    pub fn is_in(extractor: Extractor, values: Vec<Field>) -> Self {
        Filter::In(extractor, values)
    }

    pub fn contains(extractor: Extractor, value: impl Into<Field>) -> Self {
        Filter::Contains(extractor, value.into())
    }

    pub fn like(extractor: Extractor, pattern: &str) -> Self {
        Filter::Like(extractor, pattern.to_string())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    fn extractor(&self) -> Option<&Extractor> {
        match self {
            Filter::Equals(e, _)
            | Filter::NotEquals(e, _)
            | Filter::Greater(e, _)
            | Filter::GreaterEqual(e, _)
            | Filter::Less(e, _)
            | Filter::LessEqual(e, _)
            | Filter::In(e, _)
            | Filter::Contains(e, _)
            | Filter::Like(e, _)
            | Filter::IsNull(e) => Some(e),
            Filter::Between { extractor, .. } => Some(extractor),
            Filter::Always | Filter::Never | Filter::And(_) | Filter::Or(_) | Filter::Not(_) => {
                None
            }
        }
    }

    /// Canonical names of every extractor referenced by this filter
    pub fn extractor_names(&self) -> Vec<&str> {
        match self {
            Filter::And(clauses) | Filter::Or(clauses) => clauses
                .iter()
                .flat_map(|clause| clause.extractor_names())
                .collect(),
            Filter::Not(inner) => inner.extractor_names(),
            leaf => leaf
                .extractor()
                .map(|e| vec![e.canonical_name()])
                .unwrap_or_default(),
        }
    }

    /// Evaluates this filter against a single entry
    pub fn evaluate(&self, key: &[u8], value: &[u8]) -> bool {
        match self {
            Filter::Always => true,
            Filter::Never => false,
            Filter::And(clauses) => clauses.iter().all(|c| c.evaluate(key, value)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.evaluate(key, value)),
            Filter::Not(inner) => !inner.evaluate(key, value),
            leaf => {
                let Some(extractor) = leaf.extractor() else {
                    return false;
                };
                match extractor.extract(key, value) {
                    Ok(field) => leaf.matches(&field),
                    Err(err) => {
                        event!(
                            Level::WARN,
                            "extraction with {} failed for key {}: {}",
                            extractor.canonical_name(),
                            hex::encode(key),
                            err
                        );
                        false
                    }
                }
            }
        }
    }

    /// Evaluates a leaf filter against an already extracted field
    fn matches(&self, field: &Field) -> bool {
        let compare = |other: &Field| field.comparable_with(other).then(|| field.cmp(other));
        match self {
            Filter::Equals(_, v) => field == v,
            Filter::NotEquals(_, v) => field != v,
            Filter::Greater(_, v) => compare(v).is_some_and(|o| o.is_gt()),
            Filter::GreaterEqual(_, v) => compare(v).is_some_and(|o| o.is_ge()),
            Filter::Less(_, v) => compare(v).is_some_and(|o| o.is_lt()),
            Filter::LessEqual(_, v) => compare(v).is_some_and(|o| o.is_le()),
            Filter::Between { lower, upper, .. } => {
                compare(lower).is_some_and(|o| o.is_ge())
                    && compare(upper).is_some_and(|o| o.is_le())
            }
            Filter::In(_, values) => values.contains(field),
            Filter::Contains(_, v) => match field {
                Field::List(items) => items.contains(v),
                _ => false,
            },
            Filter::Like(_, pattern) => match field {
                Field::Str(s) => like(s, pattern),
                _ => false,
            },
            Filter::IsNull(_) => field.is_null(),
            Filter::Always => true,
            Filter::Never | Filter::And(_) | Filter::Or(_) | Filter::Not(_) => false,
        }
    }

    /// Resolves this filter to the exact set of matching keys using the registered indexes.
    ///
    /// Returns `None` if the filter can't be fully answered by the indexes, in which case the caller has
    /// to fall back to evaluating it entry by entry.
    pub(crate) fn index_candidates(&self, indexes: &IndexRegistry) -> Option<BTreeSet<Bytes>> {
        match self {
            Filter::Never => Some(BTreeSet::new()),
            Filter::And(clauses) => {
                let mut candidates: Option<BTreeSet<Bytes>> = None;
                for clause in clauses {
                    let keys = clause.index_candidates(indexes)?;
                    candidates = Some(match candidates {
                        None => keys,
                        Some(current) => current.intersection(&keys).cloned().collect(),
                    });
                }
                candidates
            }
            Filter::Or(clauses) => {
                let mut candidates = BTreeSet::new();
                for clause in clauses {
                    candidates.extend(clause.index_candidates(indexes)?);
                }
                Some(candidates)
            }
            Filter::Always | Filter::Not(_) | Filter::NotEquals(..) | Filter::Like(..) => None,
            leaf => {
                let index = indexes.lookup(leaf.extractor()?.canonical_name())?;
                match leaf {
                    Filter::Equals(_, v) => Some(index.equal(v)),
                    Filter::IsNull(_) => Some(index.equal(&Field::Null)),
                    Filter::In(_, values) => {
                        Some(values.iter().flat_map(|v| index.equal(v)).collect())
                    }
                    Filter::Contains(_, v) => Some(index.containing(v)),
                    Filter::Greater(_, v) => {
                        index.range(Bound::Excluded(v), Bound::Unbounded, v)
                    }
                    Filter::GreaterEqual(_, v) => {
                        index.range(Bound::Included(v), Bound::Unbounded, v)
                    }
                    Filter::Less(_, v) => index.range(Bound::Unbounded, Bound::Excluded(v), v),
                    Filter::LessEqual(_, v) => {
                        index.range(Bound::Unbounded, Bound::Included(v), v)
                    }
                    Filter::Between { lower, upper, .. } => {
                        if !lower.comparable_with(upper) {
                            return index.is_ordered().then(BTreeSet::new);
                        }
                        index.range(Bound::Included(lower), Bound::Included(upper), lower)
                    }
                    _ => None,
                }
            }
        }
    }
}

/// SQL like matching with `%` and `_` wildcards
fn like(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // matches[j]: value[..i] matches pattern[..j]
    let mut matches = vec![false; pattern.len() + 1];
    matches[0] = true;
    for j in 1..=pattern.len() {
        matches[j] = matches[j - 1] && pattern[j - 1] == '%';
    }

    for c in value.iter() {
        let mut next = vec![false; pattern.len() + 1];
        for j in 1..=pattern.len() {
            next[j] = match pattern[j - 1] {
                '%' => next[j - 1] || matches[j],
                '_' => matches[j - 1],
                p => matches[j - 1] && p == *c,
            };
        }
        matches = next;
    }

    matches[pattern.len()]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{like, Extractor, Filter};
    use crate::query::extractor::{Field, JsonPath};

    fn path(p: &str) -> Extractor {
        Arc::new(JsonPath::new(p))
    }

    #[test]
    fn test_like() {
        assert!(like("london", "lon%"));
        assert!(like("london", "%don"));
        assert!(like("london", "l_nd_n"));
        assert!(like("london", "%"));
        assert!(like("", "%"));
        assert!(!like("london", "lon"));
        assert!(!like("london", "_"));
        assert!(like("a%b", "a%b"));
    }

    #[test]
    fn test_leaf_filters() {
        let value = br#"{"age":36,"name":"ada","tags":["x","y"],"nothing":null}"#;
        let eval = |f: Filter| f.evaluate(b"k", value);

        assert!(eval(Filter::equals(path("age"), 36)));
        assert!(eval(Filter::equals(path("age"), 36.0)));
        assert!(eval(Filter::not_equals(path("age"), 35)));
        assert!(eval(Filter::greater(path("age"), 30)));
        assert!(!eval(Filter::greater(path("age"), 36)));
        assert!(eval(Filter::greater_equal(path("age"), 36)));
        assert!(eval(Filter::less(path("age"), 40.5)));
        assert!(eval(Filter::less_equal(path("age"), 36)));
        assert!(eval(Filter::between(path("age"), 36, 36)));
        assert!(!eval(Filter::between(path("age"), 37, 40)));
        assert!(eval(Filter::is_in(
            path("name"),
            vec![Field::from("bob"), Field::from("ada")]
        )));
        assert!(eval(Filter::contains(path("tags"), "y")));
        assert!(!eval(Filter::contains(path("name"), "a")));
        assert!(eval(Filter::like(path("name"), "a%")));
        assert!(eval(Filter::IsNull(path("nothing"))));
        assert!(eval(Filter::IsNull(path("missing"))));
    }

    #[test]
    fn test_comparisons_never_match_across_kinds() {
        let value = br#"{"age":"36"}"#;
        assert!(!Filter::greater(path("age"), 1).evaluate(b"k", value));
        assert!(!Filter::less(path("age"), 100).evaluate(b"k", value));
        assert!(!Filter::between(path("age"), 0, 100).evaluate(b"k", value));
    }

    #[test]
    fn test_combinators() {
        let value = br#"{"age":36,"name":"ada"}"#;
        let adult = Filter::greater_equal(path("age"), 18);
        let bob = Filter::equals(path("name"), "bob");

        assert!(Filter::And(vec![adult.clone(), Filter::not(bob.clone())]).evaluate(b"k", value));
        assert!(Filter::Or(vec![bob.clone(), adult.clone()]).evaluate(b"k", value));
        assert!(!Filter::And(vec![bob, adult]).evaluate(b"k", value));
        assert!(Filter::Always.evaluate(b"k", value));
        assert!(!Filter::Never.evaluate(b"k", value));
    }

    #[test]
    fn test_extraction_failures_do_not_match() {
        let filter = Filter::equals(path("age"), 1);
        assert!(!filter.evaluate(b"k", b"definitely not json"));
    }

    #[test]
    fn test_extractor_names() {
        let filter = Filter::And(vec![
            Filter::equals(path("a"), 1),
            Filter::not(Filter::Or(vec![Filter::IsNull(path("b")), Filter::Always])),
        ]);
        assert_eq!(filter.extractor_names(), vec!["a", "b"]);
    }
}
