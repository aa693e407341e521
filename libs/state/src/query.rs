//! Label queries for list operations.
//!
//! A query is an AND-composition of label predicates plus an optional id
//! prefix. Label keys match by exact equality; an empty label value is a
//! valid, meaningful value.

use crate::resource::Metadata;

/// A single label predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelTerm {
    Equal(String, String),
    Exists(String),
    NotExists(String),
    In(String, Vec<String>),
}

impl LabelTerm {
    fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::Equal(key, value) => metadata.labels.get(key) == Some(value),
            Self::Exists(key) => metadata.labels.contains_key(key),
            Self::NotExists(key) => !metadata.labels.contains_key(key),
            Self::In(key, values) => metadata
                .labels
                .get(key)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
        }
    }
}

/// AND-composed label predicates with an optional id prefix.
#[derive(Debug, Clone, Default)]
pub struct Query {
    terms: Vec<LabelTerm>,
    id_prefix: Option<String>,
}

impl Query {
    /// Matches every resource in a collection.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn equal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Equal(key.into(), value.into()));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Exists(key.into()));
        self
    }

    pub fn not_exists(mut self, key: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::NotExists(key.into()));
        self
    }

    pub fn in_values(mut self, key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.terms.push(LabelTerm::In(
            key.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !metadata.id.starts_with(prefix.as_str()) {
                return false;
            }
        }

        self.terms.iter().all(|term| term.matches(metadata))
    }

    /// First equality term, used to seed candidates from the label index.
    pub(crate) fn first_equal(&self) -> Option<(&str, &str)> {
        self.terms.iter().find_map(|term| match term {
            LabelTerm::Equal(key, value) => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceSpec};

    #[derive(Debug, Clone, PartialEq)]
    struct TestSpec;

    impl ResourceSpec for TestSpec {
        fn resource_type(&self) -> &'static str {
            "Tests"
        }
    }

    fn labeled(id: &str, labels: &[(&str, &str)]) -> Resource<TestSpec> {
        let mut res = Resource::new("default", id, TestSpec);
        for (k, v) in labels {
            res.metadata_mut().labels.insert(k.to_string(), v.to_string());
        }
        res
    }

    #[test]
    fn test_equal_and_exists() {
        let res = labeled("a", &[("role", "worker"), ("flag", "")]);

        assert!(Query::all().equal("role", "worker").matches(res.metadata()));
        assert!(!Query::all().equal("role", "control").matches(res.metadata()));
        assert!(Query::all().exists("flag").matches(res.metadata()));
        assert!(Query::all().not_exists("missing").matches(res.metadata()));
    }

    #[test]
    fn test_empty_value_is_meaningful() {
        let res = labeled("a", &[("flag", "")]);

        assert!(Query::all().equal("flag", "").matches(res.metadata()));
        assert!(!Query::all().equal("flag", "x").matches(res.metadata()));
    }

    #[test]
    fn test_in_values() {
        let res = labeled("a", &[("zone", "b")]);

        assert!(Query::all().in_values("zone", ["a", "b"]).matches(res.metadata()));
        assert!(!Query::all().in_values("zone", ["c"]).matches(res.metadata()));
    }

    #[test]
    fn test_terms_compose_with_and() {
        let res = labeled("a", &[("role", "worker"), ("zone", "b")]);

        assert!(Query::all()
            .equal("role", "worker")
            .exists("zone")
            .matches(res.metadata()));
        assert!(!Query::all()
            .equal("role", "worker")
            .equal("zone", "c")
            .matches(res.metadata()));
    }

    #[test]
    fn test_id_prefix() {
        let res = labeled("machine-1", &[]);

        assert!(Query::all().with_id_prefix("machine-").matches(res.metadata()));
        assert!(!Query::all().with_id_prefix("node-").matches(res.metadata()));
    }
}
