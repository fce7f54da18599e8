//! Strongly-typed identifiers for keel entities.
//!
//! - [`PathId`]: hierarchical identity of a run spec (`/prod/web`)
//! - [`InstanceId`]: one scheduling unit launched from a spec; embeds the
//!   spec path so the owning spec can be recovered from the id alone
//! - [`TaskId`]: derived from its instance id plus an optional container name
//! - [`SessionId`], [`FrameworkId`]: opaque offer-source identities
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::{InstanceId, PathId, TaskId};
//!
//! let spec: PathId = "/prod/web".parse().unwrap();
//! let instance = InstanceId::for_spec(&spec);
//! let task = TaskId::for_instance(&instance);
//!
//! assert_eq!(instance.spec_id(), &spec);
//! assert_eq!(task.instance_id(), &instance);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

const INSTANCE_MARKER: &str = ".instance-";
const ULID_LEN: usize = 26;

/// Hierarchical identifier of a run spec.
///
/// Segments consist of lowercase ASCII letters, digits, `-` and `.`, and
/// must start and end with a letter or digit. The root path has no segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathId {
    segments: Vec<String>,
}

impl PathId {
    /// Returns the root path `/`.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the path segments, outermost first.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns a child path one level below this one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if `name` is not a valid segment.
    pub fn child(&self, name: &str) -> Result<Self> {
        validate_segment(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// Returns the parent path; the root is its own parent.
    #[must_use]
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Returns true if `self` equals `other` or lies below it.
    #[must_use]
    pub fn is_under(&self, other: &Self) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Returns the path with `/` replaced by `_`, usable inside other ids.
    #[must_use]
    pub fn safe_path(&self) -> String {
        self.segments.join("_")
    }

    /// Reverses [`PathId::safe_path`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if any segment is invalid.
    pub fn from_safe_path(safe: &str) -> Result<Self> {
        if safe.is_empty() {
            return Ok(Self::root());
        }
        let segments = safe
            .split('_')
            .map(|s| validate_segment(s).map(|()| s.to_string()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { segments })
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let ok = segment.chars().next().is_some_and(valid_char)
        && segment.chars().last().is_some_and(valid_char)
        && segment
            .chars()
            .all(|c| valid_char(c) || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidId {
            message: format!("invalid path segment '{segment}'"),
        })
    }
}

fn validate_container(name: &str) -> Result<()> {
    validate_segment(name)?;
    if name.contains(INSTANCE_MARKER) {
        return Err(Error::InvalidId {
            message: format!("container name '{name}' contains '{INSTANCE_MARKER}'"),
        });
    }
    Ok(())
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for PathId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments = trimmed
            .split('/')
            .map(|seg| validate_segment(seg).map(|()| seg.to_string()))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::InvalidId {
                message: format!("invalid path '{s}': {e}"),
            })?;
        Ok(Self { segments })
    }
}

impl TryFrom<String> for PathId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PathId> for String {
    fn from(value: PathId) -> Self {
        value.to_string()
    }
}

/// Identifier of a single instance launched from a run spec.
///
/// Rendered as `<safe spec path>.instance-<ulid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId {
    spec_id: PathId,
    uid: Ulid,
}

impl InstanceId {
    /// Generates a fresh instance id for the given spec.
    #[must_use]
    pub fn for_spec(spec_id: &PathId) -> Self {
        Self {
            spec_id: spec_id.clone(),
            uid: Ulid::new(),
        }
    }

    /// Returns the spec this instance was launched from.
    #[must_use]
    pub const fn spec_id(&self) -> &PathId {
        &self.spec_id
    }

    /// Returns the unique part of the id.
    #[must_use]
    pub const fn uid(&self) -> Ulid {
        self.uid
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{INSTANCE_MARKER}{}", self.spec_id.safe_path(), self.uid)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidId {
            message: format!("invalid instance ID '{s}': {reason}"),
        };
        let pos = s
            .rfind(INSTANCE_MARKER)
            .ok_or_else(|| invalid("missing instance marker"))?;
        let spec_id = PathId::from_safe_path(&s[..pos]).map_err(|e| invalid(&e.to_string()))?;
        let uid = Ulid::from_string(&s[pos + INSTANCE_MARKER.len()..])
            .map_err(|e| invalid(&e.to_string()))?;
        Ok(Self { spec_id, uid })
    }
}

impl TryFrom<String> for InstanceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<InstanceId> for String {
    fn from(value: InstanceId) -> Self {
        value.to_string()
    }
}

/// Identifier of a task inside an instance.
///
/// Rendered as `<instanceId>` or `<instanceId>.<container>`. The id is a
/// pure function of its parts, so it never changes over the task's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    instance_id: InstanceId,
    container: Option<String>,
}

impl TaskId {
    /// Derives the id of the single task of an instance.
    #[must_use]
    pub fn for_instance(instance_id: &InstanceId) -> Self {
        Self {
            instance_id: instance_id.clone(),
            container: None,
        }
    }

    /// Derives the id of a named container task inside a pod instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the name is not a valid id segment or
    /// contains the instance marker, since the rendered id would not parse
    /// back.
    pub fn for_container(instance_id: &InstanceId, container: &str) -> Result<Self> {
        validate_container(container)?;
        Ok(Self {
            instance_id: instance_id.clone(),
            container: Some(container.to_string()),
        })
    }

    /// Returns the owning instance.
    #[must_use]
    pub const fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Returns the container discriminator, if any.
    #[must_use]
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(f, "{}.{container}", self.instance_id),
            None => write!(f, "{}", self.instance_id),
        }
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidId {
            message: format!("invalid task ID '{s}': {reason}"),
        };
        let pos = s
            .rfind(INSTANCE_MARKER)
            .ok_or_else(|| invalid("missing instance marker"))?;
        let end = pos + INSTANCE_MARKER.len() + ULID_LEN;
        if s.len() < end || !s.is_char_boundary(end) {
            return Err(invalid("truncated instance part"));
        }
        let instance_id: InstanceId = s[..end].parse()?;
        let container = match &s[end..] {
            "" => None,
            rest => match rest.strip_prefix('.') {
                Some(name) if validate_container(name).is_ok() => Some(name.to_string()),
                _ => return Err(invalid("malformed container suffix")),
            },
        };
        Ok(Self {
            instance_id,
            container,
        })
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.to_string()
    }
}

/// Identity of one connection session with the offer source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an existing session identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a unique session identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the session identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity the offer source assigned to this framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameworkId(String);

impl FrameworkId {
    /// Wraps a framework id value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_id_parses_and_renders() {
        let path: PathId = "/prod/web".parse().unwrap();
        assert_eq!(path.to_string(), "/prod/web");
        assert_eq!(path.segments(), ["prod", "web"]);
        assert_eq!(path.parent().to_string(), "/prod");
        assert!(path.parent().parent().is_root());
        assert_eq!(PathId::root().to_string(), "/");
    }

    #[test]
    fn path_id_rejects_invalid_segments() {
        assert!("/Prod".parse::<PathId>().is_err());
        assert!("/a_b".parse::<PathId>().is_err());
        assert!("/-web".parse::<PathId>().is_err());
        assert!(PathId::root().child("web-").is_err());
    }

    #[test]
    fn path_id_child_and_is_under() {
        let foo: PathId = "/foo".parse().unwrap();
        let a = foo.child("a").unwrap();
        assert_eq!(a.to_string(), "/foo/a");
        assert!(a.is_under(&foo));
        assert!(!foo.is_under(&a));
    }

    #[test]
    fn safe_path_roundtrip() {
        let path: PathId = "/prod/web.v2/api".parse().unwrap();
        assert_eq!(path.safe_path(), "prod_web.v2_api");
        assert_eq!(PathId::from_safe_path(&path.safe_path()).unwrap(), path);
    }

    #[test]
    fn instance_id_recovers_spec() {
        let spec: PathId = "/prod/web.instance-x".parse().unwrap();
        let id = InstanceId::for_spec(&spec);
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.spec_id(), &spec);
    }

    #[test]
    fn task_id_is_derived_from_instance() {
        let spec: PathId = "/db".parse().unwrap();
        let instance = InstanceId::for_spec(&spec);

        let plain = TaskId::for_instance(&instance);
        assert_eq!(plain.to_string(), instance.to_string());
        assert_eq!(plain, TaskId::for_instance(&instance));

        let sidecar = TaskId::for_container(&instance, "sidecar").unwrap();
        let parsed: TaskId = sidecar.to_string().parse().unwrap();
        assert_eq!(parsed.container(), Some("sidecar"));
        assert_eq!(parsed.instance_id(), &instance);
    }

    #[test]
    fn container_names_must_render_parseable_ids() {
        let spec: PathId = "/db".parse().unwrap();
        let instance = InstanceId::for_spec(&spec);

        assert!(TaskId::for_container(&instance, "").is_err());
        assert!(TaskId::for_container(&instance, "Sidecar").is_err());
        assert!(TaskId::for_container(&instance, "a.instance-b").is_err());

        let task = TaskId::for_container(&instance, "log-shipper.v2").unwrap();
        let parsed: TaskId = task.to_string().parse().unwrap();
        assert_eq!(parsed, task);
        assert!(format!("{instance}.").parse::<TaskId>().is_err());
    }

    #[test]
    fn invalid_ids_return_errors() {
        assert!("not-an-instance".parse::<InstanceId>().is_err());
        assert!("web.instance-short".parse::<TaskId>().is_err());
    }

    #[test]
    fn ids_serialize_as_strings() {
        let spec: PathId = "/web".parse().unwrap();
        let id = InstanceId::for_spec(&spec);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
