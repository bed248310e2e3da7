//! Type-erased descriptions of a resource kind.
use crate::resource::Resource;
use std::fmt;

/// Contains information about a Kubernetes API resource kind
/// which is enough for addressing it on the API server.
///
/// This is the `{group, apiVersion, plural}` triple that the API client boundary
/// is parameterized with, plus the kind for logging.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ApiResource {
    /// Resource group, empty for core group.
    pub group: String,
    /// group version
    pub version: String,
    /// apiVersion of the resource (v1 for core group,
    /// groupName/groupVersions for other).
    pub api_version: String,
    /// Singular PascalCase name of the resource
    pub kind: String,
    /// Plural name of the resource
    pub plural: String,
}

impl ApiResource {
    /// Creates ApiResource by type-erasing another Resource
    #[must_use]
    pub fn erase<K: Resource>() -> Self {
        ApiResource {
            group: K::group().to_string(),
            version: K::version().to_string(),
            api_version: K::api_version().to_string(),
            kind: K::kind().to_string(),
            plural: K::plural().to_string(),
        }
    }

    /// Creates ApiResource from group, version, kind and plural name.
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        let api_version = match group {
            "" => version.to_string(),
            _ => format!("{group}/{version}"),
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }
}

impl fmt::Display for ApiResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.plural)
        } else {
            write!(f, "{}.{}", self.plural, self.group)
        }
    }
}
