//! Query predicates.
//!
//! There is no query language: an [`EntityFilter`] is an opaque predicate
//! evaluated against each candidate record. Backends narrow candidates by
//! partition where they can and apply the predicate client-side.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::types::EntityRecord;

type Predicate = dyn Fn(&EntityRecord) -> bool + Send + Sync;

/// A predicate over entity records.
///
/// # Examples
///
/// ```
/// use helios_entity_store::core::EntityFilter;
/// use helios_entity_store::types::EntityRecord;
/// use serde_json::json;
///
/// let filter = EntityFilter::field_eq("status", json!("open"));
/// let open = EntityRecord::new(json!({"status": "open"})).unwrap();
/// let closed = EntityRecord::new(json!({"status": "closed"})).unwrap();
/// assert!(filter.matches(&open));
/// assert!(!filter.matches(&closed));
/// ```
#[derive(Clone)]
pub struct EntityFilter {
    predicate: Arc<Predicate>,
    description: String,
}

impl EntityFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self {
            predicate: Arc::new(|_| true),
            description: "all".to_string(),
        }
    }

    /// Wraps an arbitrary predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&EntityRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            description: "custom".to_string(),
        }
    }

    /// Matches records whose top-level payload `field` equals `value`.
    pub fn field_eq(field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        let description = format!("{} == {}", field, value);
        Self {
            predicate: Arc::new(move |record: &EntityRecord| {
                record.payload().get(field.as_str()) == Some(&value)
            }),
            description,
        }
    }

    /// Matches records accepted by both filters.
    pub fn and(self, other: EntityFilter) -> Self {
        let description = format!("({}) and ({})", self.description, other.description);
        let (left, right) = (self.predicate, other.predicate);
        Self {
            predicate: Arc::new(move |record: &EntityRecord| left(record) && right(record)),
            description,
        }
    }

    /// Evaluates the predicate.
    pub fn matches(&self, record: &EntityRecord) -> bool {
        (self.predicate)(record)
    }
}

impl Default for EntityFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for EntityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityFilter")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_matches_everything() {
        let record = EntityRecord::new(json!({})).unwrap();
        assert!(EntityFilter::all().matches(&record));
        assert!(EntityFilter::default().matches(&record));
    }

    #[test]
    fn test_and_combines() {
        let filter = EntityFilter::field_eq("a", json!(1)).and(EntityFilter::field_eq("b", json!(2)));
        assert!(filter.matches(&EntityRecord::new(json!({"a": 1, "b": 2})).unwrap()));
        assert!(!filter.matches(&EntityRecord::new(json!({"a": 1, "b": 3})).unwrap()));
        assert!(format!("{:?}", filter).contains("a == 1"));
    }

    #[test]
    fn test_custom_predicate() {
        let filter = EntityFilter::new(|r| r.version() == 0);
        assert!(filter.matches(&EntityRecord::new(json!({})).unwrap()));
    }
}
