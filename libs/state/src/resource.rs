//! Resource model: metadata, versions, ownership, and typed specs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Monotonically increasing per-resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// Matches any stored version in compare-and-swap updates.
    pub const UNDEFINED: Version = Version(0);

    /// Version assigned on first create.
    pub(crate) fn initial() -> Version {
        Version(1)
    }

    pub(crate) fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn is_undefined(&self) -> bool {
        self.0 == 0
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Lifecycle phase of a resource.
///
/// A resource enters `TearingDown` when a destroy is requested while
/// finalizers are still attached; the destroy completes once the last
/// finalizer is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    TearingDown,
}

/// Identity of a controller, used as the owner tag on resources.
///
/// Backed by a shared string so per-write clones are refcount bumps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(Arc<str>);

impl Owner {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed spec payload stored in a resource.
///
/// Implemented by the domain's tagged spec enum; the store only needs the
/// type tag and value equality.
pub trait ResourceSpec: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Static type tag of this spec value.
    fn resource_type(&self) -> &'static str;
}

/// Address of a resource in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub namespace: String,
    pub resource_type: &'static str,
    pub id: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, resource_type: &'static str, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.resource_type, self.id)
    }
}

/// Resource metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub namespace: String,
    pub resource_type: &'static str,
    pub id: String,
    pub version: Version,
    pub owner: Option<Owner>,
    pub phase: Phase,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub finalizers: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    fn new(namespace: String, resource_type: &'static str, id: String) -> Self {
        let now = Utc::now();

        Self {
            namespace,
            resource_type,
            id,
            version: Version::UNDEFINED,
            owner: None,
            phase: Phase::Running,
            created: now,
            updated: now,
            finalizers: BTreeSet::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            namespace: self.namespace.clone(),
            resource_type: self.resource_type,
            id: self.id.clone(),
        }
    }
}

/// A stored object: metadata plus a typed spec.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource<S> {
    metadata: Metadata,
    spec: S,
}

impl<S: ResourceSpec> Resource<S> {
    /// Create a new resource value; the type tag comes from the spec.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, spec: S) -> Self {
        let resource_type = spec.resource_type();

        Self {
            metadata: Metadata::new(namespace.into(), resource_type, id.into()),
            spec,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn spec(&self) -> &S {
        &self.spec
    }

    pub fn spec_mut(&mut self) -> &mut S {
        &mut self.spec
    }

    pub fn reference(&self) -> ResourceRef {
        self.metadata.reference()
    }
}
