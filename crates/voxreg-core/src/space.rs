//! Named coordinate reference frames.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A named physical reference frame, e.g. `subject-native` or `template`.
///
/// Transforms and volumes are tagged with spaces so that chaining mistakes
/// surface as errors instead of silently misaligned results.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CoordinateSpace(Arc<str>);

impl CoordinateSpace {
    /// Create a space from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The space name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoordinateSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CoordinateSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoordinateSpace({})", self.0)
    }
}

impl From<&str> for CoordinateSpace {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Serialize for CoordinateSpace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CoordinateSpace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::new(name))
    }
}

/// Ordered `(source, target)` pair carried by every tagged transform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpacePair {
    pub source: CoordinateSpace,
    pub target: CoordinateSpace,
}

impl SpacePair {
    pub fn new(source: CoordinateSpace, target: CoordinateSpace) -> Self {
        Self { source, target }
    }

    /// The pair with source and target swapped.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }
}
