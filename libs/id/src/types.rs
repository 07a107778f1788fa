//! Resource identity and typed ID definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{define_id, IdError, Ulid};

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(EventId, "evt");
define_id!(ScalingEventId, "scl");

// =============================================================================
// Names
// =============================================================================

/// Maximum length of a name or namespace.
pub const MAX_NAME_LEN: usize = 63;

/// Validates a DNS-label style name: lowercase alphanumerics and `-`,
/// starting and ending with an alphanumeric, at most 63 characters.
pub fn validate_name(value: &str) -> Result<(), IdError> {
    let invalid = |message: &str| IdError::InvalidName {
        value: value.to_string(),
        message: message.to_string(),
    };

    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 63 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("only lowercase alphanumerics and '-' are allowed"));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(invalid("must start and end with an alphanumeric"));
    }
    Ok(())
}

/// Generates a unique, DNS-safe name of the form `{base}-{ulid}`.
///
/// The base is truncated so the result never exceeds [`MAX_NAME_LEN`].
pub fn generate_name(base: &str) -> String {
    let suffix = Ulid::new().to_string().to_lowercase();
    let max_base = MAX_NAME_LEN - suffix.len() - 1;
    let base = base.get(..base.len().min(max_base)).unwrap_or(base);
    format!("{}-{}", base.trim_end_matches('-'), suffix)
}

// =============================================================================
// Resource identity
// =============================================================================

/// Identity of a managed resource: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    namespace: String,
    name: String,
}

impl ResourceId {
    /// Creates a resource id, validating both halves.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_name(&namespace)?;
        validate_name(&name)?;
        Ok(Self { namespace, name })
    }

    /// Parses `namespace/name`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator('/'));
        };
        Self::new(namespace, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
