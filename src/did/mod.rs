//! Data identifiers: the `(scope, name)` pairs every catalog entity is
//! addressed by, and the resolver that splits a combined identifier.

pub mod ids;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WorkflowError;
use crate::validation::{validate_name, validate_scope};

/// A `(scope, name)` pair identifying a file, dataset or container.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Did {
    pub scope: String,
    pub name: String,
}

impl Did {
    /// Creates a DID without validating either half.
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Creates a dataset DID, validating scope and name. The name may not
    /// contain a colon, so `scope:name` always splits back into the same pair.
    pub fn dataset(scope: &str, name: &str) -> Result<Self, WorkflowError> {
        validate_scope(scope)?;
        validate_name(name)?;
        if name.contains(':') {
            return Err(WorkflowError::validation(format!(
                "Dataset name cannot contain ':': '{}'",
                name
            )));
        }
        Ok(Self::new(scope, name))
    }

    /// Resolves a combined identifier (`scope:name` or dotted form) into a
    /// validated dataset DID.
    pub fn parse(identifier: &str) -> Result<Self, WorkflowError> {
        validate_name(identifier)?;
        let (scope, name) = resolve_scope(identifier, false)?;
        Self::dataset(&scope, &name)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Splits a combined identifier into `(scope, name)`.
///
/// An explicit colon always wins and is split on its first occurrence.
/// Without a colon the dotted form is inferred: `user.*` and `group.*`
/// identifiers keep their first two segments as the scope, everything else
/// keeps all but the last segment.
///
/// ```
/// use rucio_workflow::did::resolve_scope;
///
/// let (scope, name) = resolve_scope("user.pilot:my.complex.name", false).unwrap();
/// assert_eq!((scope.as_str(), name.as_str()), ("user.pilot", "my.complex.name"));
/// ```
pub fn resolve_scope(
    identifier: &str,
    strip_trailing_slash: bool,
) -> Result<(String, String), WorkflowError> {
    let identifier = if strip_trailing_slash {
        identifier.strip_suffix('/').unwrap_or(identifier)
    } else {
        identifier
    };

    if let Some((scope, name)) = identifier.split_once(':') {
        return Ok((scope.trim().to_string(), name.trim().to_string()));
    }

    let parts: Vec<&str> = identifier.split('.').collect();
    let (last, rest) = match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() => (*last, rest),
        _ => {
            return Err(WorkflowError::validation(format!(
                "Dataset name must contain at least one dot or colon: {}",
                identifier
            )));
        }
    };

    // prefix match, not segment match: "username.x.y" takes this branch too
    if identifier.starts_with("user") || identifier.starts_with("group") {
        if parts.len() >= 3 {
            Ok((parts[..2].join("."), parts[2..].join(".")))
        } else {
            Ok((parts[0].to_string(), parts[1..].join(".")))
        }
    } else {
        Ok((rest.join("."), last.to_string()))
    }
}
