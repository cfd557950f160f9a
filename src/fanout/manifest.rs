//! Manifest entries
//!
//! The batch manifest is a JSON array of [`GroupRef`]s; each group manifest
//! is a JSON array of [`LeafRef`]s.

use serde::{Deserialize, Serialize};

/// One group listed in the batch manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    /// Group identifier, also the group's directory name
    pub id: String,
    /// Explicit URL of the group's item manifest
    ///
    /// When absent the URL is `run.group_manifest_base` followed by `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

/// One leaf item listed in a group manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRef {
    /// Item identifier, also the payload's file name
    pub id: String,
    /// Where the payload is fetched from
    pub url: String,
}

/// A leaf that was fetched and stored (or was already held)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafReceipt {
    /// URL actually requested, after overrides
    pub url: String,
    /// Payload size in bytes (0 when the sink already held it)
    pub bytes: usize,
    /// True if the payload was already held and no request was made
    pub skipped: bool,
}
