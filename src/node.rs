//! Managed node records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest accepted node name.
const MAX_NAME_LEN: usize = 128;

/// A managed host whose console the server can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique, immutable identifier.
    pub name: String,
    /// Driver kind (`cmd`, `ssh`, `ipmitool`).
    #[serde(default)]
    pub driver: String,
    /// Driver-specific connection parameters (host, user, port, ...).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Open the console lazily on first attach and close it when unattended.
    #[serde(default = "default_ondemand")]
    pub ondemand: bool,
}

/// Records that omit `ondemand` are lazy: no console opens until someone
/// attaches.
const fn default_ondemand() -> bool {
    true
}

impl Node {
    /// Create an on-demand node with no parameters.
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            params: BTreeMap::new(),
            ondemand: true,
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_ondemand(mut self, ondemand: bool) -> Self {
        self.ondemand = ondemand;
        self
    }

    /// The `host` parameter, if any.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.params.get("host").map(String::as_str)
    }

    /// Look up a parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Name-only record used by bulk delete and bulk state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeName {
    pub name: String,
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

/// Replacement values for the mutable fields of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub params: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ondemand: Option<bool>,
}

impl NodeUpdate {
    /// Apply this update to `node`.
    pub fn apply(&self, node: &mut Node) {
        if let Some(params) = &self.params {
            node.params.clone_from(params);
        }
        if let Some(ondemand) = self.ondemand {
            node.ondemand = ondemand;
        }
    }
}

/// Check that a node name can be used as a registry key and a log file name.
///
/// Names are 1-128 chars of alphanumerics, `-`, `_` and `.`, and may not start
/// with a dot.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("node name is not defined".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "node name too long ({} chars, max {MAX_NAME_LEN})",
            name.len()
        ));
    }
    if name.starts_with('.') {
        return Err(format!("node name may not start with '.': {name}"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("node name contains invalid characters: {name}"));
    }
    Ok(())
}
