//! Kubeclerk core types: kind and instance identifiers, generic objects, list
//! options and the error taxonomy shared by every layer.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod object;

pub use object::{escape_json_pointer, GenericObject, OwnerReference};

/// Suffix appended to a kind name to address its collection kind.
pub const LIST_SUFFIX: &str = "List";

/// Identifies a resource type: `(group, version, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindId {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindId {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` (`v1` or `group/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Collection counterpart (`Kind` -> `KindList`).
    pub fn list_kind(&self) -> KindId {
        Self::new(self.group.clone(), self.version.clone(), format!("{}{}", self.kind, LIST_SUFFIX))
    }

    pub fn is_collection(&self) -> bool {
        self.kind.ends_with(LIST_SUFFIX)
    }

    /// Singular counterpart of a collection kind, `None` when this is not one.
    pub fn item_kind(&self) -> Option<KindId> {
        let item = self.kind.strip_suffix(LIST_SUFFIX)?;
        if item.is_empty() {
            return None;
        }
        Some(Self::new(self.group.clone(), self.version.clone(), item))
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for KindId {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(Error::Invalid(format!("invalid gvk key: '{}' (expect v1/Kind or group/v1/Kind)", key))),
        }
    }
}

/// Identifies an object of a kind: `(namespace, name)`. The namespace is empty
/// for cluster-scoped kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub namespace: String,
    pub name: String,
}

impl InstanceId {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<_> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(*ns, *name)),
            _ => Err(Error::Invalid(format!("invalid namespaced name '{}'", s))),
        }
    }
}

/// Equality-based label selector (`a=b,c=d`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    pub terms: SmallVec<[(String, String); 4]>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, obj: &GenericObject) -> bool {
        let labels = obj.labels();
        self.terms.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.terms.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&rendered.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut terms = SmallVec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (k, v) = term
                .split_once('=')
                .ok_or_else(|| Error::Invalid(format!("invalid label selector term '{}' (expect key=value)", term)))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(Error::Invalid(format!("invalid label selector term '{}': empty key", term)));
            }
            terms.push((k.to_string(), v.trim().to_string()));
        }
        Ok(Self { terms })
    }
}

/// Filters accepted by list operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to a single namespace; `None` lists across all namespaces.
    pub namespace: Option<String>,
    pub label_selector: LabelSelector,
}

impl ListOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), ..Self::default() }
    }

    pub fn with_labels(mut self, selector: LabelSelector) -> Self {
        self.label_selector = selector;
        self
    }

    pub fn matches(&self, obj: &GenericObject) -> bool {
        if let Some(ns) = self.namespace.as_deref() {
            if obj.namespace().unwrap_or("") != ns {
                return false;
            }
        }
        self.label_selector.matches(obj)
    }
}

/// Error taxonomy surfaced by the registry, the stores and the facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no kind {0} is registered")]
    NotRegistered(KindId),
    #[error("{kind} \"{id}\" not found")]
    NotFound { kind: KindId, id: InstanceId },
    #[error("{kind} \"{id}\" already exists")]
    AlreadyExists { kind: KindId, id: InstanceId },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_registered(&self) -> bool { matches!(self, Error::NotRegistered(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Error::AlreadyExists { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict(_)) }
    pub fn is_invalid(&self) -> bool { matches!(self, Error::Invalid(_)) }
    pub fn is_backend(&self) -> bool { matches!(self, Error::Backend(_)) }

    /// Short label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NotRegistered(_) => "not_registered",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Conflict(_) => "conflict",
            Error::Invalid(_) => "invalid",
            Error::Backend(_) => "backend",
        }
    }
}

pub mod prelude {
    pub use super::{Error, GenericObject, InstanceId, KindId, LabelSelector, ListOptions, OwnerReference, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_id_parses_core_and_grouped_keys() {
        assert_eq!("v1/Namespace".parse::<KindId>().unwrap(), KindId::new("", "v1", "Namespace"));
        assert_eq!("apps/v1/Deployment".parse::<KindId>().unwrap(), KindId::new("apps", "v1", "Deployment"));
        for bad in ["", "Namespace", "a/b/c/d", "/v1/Kind", "v1/"] {
            let err = bad.parse::<KindId>().unwrap_err();
            assert!(err.is_invalid(), "{} should be invalid", bad);
        }
    }

    #[test]
    fn kind_id_renders_api_version_and_key() {
        let core = KindId::new("", "v1", "Service");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.to_string(), "v1/Service");
        let apps = KindId::new("apps", "v1", "Deployment");
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.to_string(), "apps/v1/Deployment");
        assert_eq!(KindId::from_api_version("apps/v1", "Deployment"), apps);
    }

    #[test]
    fn list_kind_round_trips_through_item_kind() {
        let svc = KindId::new("", "v1", "Service");
        let list = svc.list_kind();
        assert_eq!(list.kind, "ServiceList");
        assert!(list.is_collection());
        assert!(!svc.is_collection());
        assert_eq!(list.item_kind(), Some(svc));
        assert_eq!(KindId::new("", "v1", "List").item_kind(), None);
    }

    #[test]
    fn instance_id_parses_names() {
        assert_eq!("default".parse::<InstanceId>().unwrap(), InstanceId::cluster("default"));
        assert_eq!("default/app".parse::<InstanceId>().unwrap(), InstanceId::namespaced("default", "app"));
        assert!("".parse::<InstanceId>().unwrap_err().is_invalid());
        assert!("a/b/c".parse::<InstanceId>().unwrap_err().is_invalid());
        assert_eq!(InstanceId::namespaced("ns", "x").to_string(), "ns/x");
        assert_eq!(InstanceId::cluster("x").namespace(), None);
    }

    #[test]
    fn label_selector_parses_and_matches() {
        let sel: LabelSelector = "app=web, tier=front".parse().unwrap();
        assert_eq!(sel.terms.len(), 2);
        assert_eq!(sel.to_string(), "app=web,tier=front");

        let mut obj = GenericObject::new();
        obj.set_label("app", "web");
        assert!(!sel.matches(&obj));
        obj.set_label("tier", "front");
        assert!(sel.matches(&obj));

        assert!("novalue".parse::<LabelSelector>().unwrap_err().is_invalid());
        assert!("".parse::<LabelSelector>().unwrap().is_empty());
    }

    #[test]
    fn list_options_filter_by_namespace() {
        let mut obj = GenericObject::new();
        obj.set_namespace("default");
        assert!(ListOptions::all().matches(&obj));
        assert!(ListOptions::in_namespace("default").matches(&obj));
        assert!(!ListOptions::in_namespace("kube-system").matches(&obj));
    }
}
