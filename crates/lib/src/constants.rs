//! Shared constants for the livetree crate.

/// Id of the immortal root node. The root always exists, has no parent, and
/// ignores deletion.
pub const ROOT_ID: &str = "root";

/// Reserved row key holding a node's kind ("Object", "List", "Map", "Register").
pub(crate) const KIND_KEY: &str = "$kind";

/// Reserved row key holding a node's `[parentId, parentKey]` link (JSON array,
/// `null` for the root).
pub(crate) const PARENT_KEY: &str = "$parent";

/// Reserved row key holding a register node's payload.
pub(crate) const VALUE_KEY: &str = "$value";

/// Marker field used when flattening a node ref into a wire delta value.
pub(crate) const REF_MARKER: &str = "$ref";

/// Meta key under which the SQL driver persists its committed clock.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) const CLOCK_META_KEY: &str = "$clock";
