//! Identifier types used across the engine.

use crate::define_id;

define_id!(BlueprintId, "bp");
define_id!(ResourceId, "res");

/// Identifier of a deployment area.
///
/// Areas are numbered by the topology that maps them to a backend, so this
/// is a plain integer rather than a generated ULID.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct AreaId(u32);

impl AreaId {
    /// Creates an area id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for AreaId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AreaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
