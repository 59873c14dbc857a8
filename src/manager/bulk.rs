//! Per-name outcomes of bulk operations.

use crate::error::{ErrorKind, ManagerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of one item in a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Failed {
        error: ErrorKind,
        reason: String,
    },
}

impl Outcome {
    #[must_use]
    pub const fn ok() -> Self {
        Self::Succeeded { warning: None }
    }

    #[must_use]
    pub fn failed(error: &ManagerError) -> Self {
        Self::Failed {
            error: error.kind(),
            reason: error.to_string(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    #[must_use]
    pub const fn error(&self) -> Option<ErrorKind> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { error, .. } => Some(*error),
        }
    }
}

impl From<Result<Option<String>, ManagerError>> for Outcome {
    fn from(result: Result<Option<String>, ManagerError>) -> Self {
        match result {
            Ok(warning) => Self::Succeeded { warning },
            Err(e) => Self::failed(&e),
        }
    }
}

/// Name-keyed outcomes of a bulk operation.
///
/// Each name maps to its outcomes in submission order. The first is the
/// outcome of the item that was actually processed; any further entries
/// record repeated occurrences of the name in the same batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BulkResult(BTreeMap<String, Vec<Outcome>>);

impl BulkResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, name: &str, outcome: Outcome) {
        self.0.entry(name.to_string()).or_default().push(outcome);
    }

    /// The authoritative outcome for `name`.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.0.get(name).and_then(|outcomes| outcomes.first())
    }

    /// Every outcome recorded for `name`.
    #[must_use]
    pub fn outcomes(&self, name: &str) -> &[Outcome] {
        self.0.get(name).map_or(&[], Vec::as_slice)
    }

    /// Names whose authoritative outcome is a failure.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.iter().filter(|(_, outcome)| !outcome.is_success())
    }

    /// Names with their authoritative outcome.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.0
            .iter()
            .filter_map(|(name, outcomes)| Some((name.as_str(), outcomes.first()?)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of submitted items, repeats included.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Number of failed items, repeats included.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.0
            .values()
            .flatten()
            .filter(|outcome| !outcome.is_success())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_outcome_is_authoritative() {
        let mut result = BulkResult::new();
        result.record("a", Outcome::ok());
        result.record(
            "a",
            Outcome::failed(&ManagerError::Conflict("duplicate".into())),
        );
        result.record("b", Outcome::failed(&ManagerError::NotFound("b".into())));

        assert_eq!(result.len(), 2);
        assert_eq!(result.outcome("a"), Some(&Outcome::ok()));
        assert_eq!(result.outcomes("a").len(), 2);
        assert_eq!(result.outcomes("a")[1].error(), Some(ErrorKind::Conflict));

        let failed: Vec<_> = result.failed().map(|(name, _)| name).collect();
        assert_eq!(failed, ["b"]);
        assert_eq!(result.item_count(), 3);
        assert_eq!(result.failure_count(), 2);
    }

    #[test]
    fn test_wire_shape() {
        let mut result = BulkResult::new();
        result.record("a", Outcome::ok());
        result.record(
            "b",
            Outcome::Succeeded {
                warning: Some("console not opened".into()),
            },
        );
        result.record("c", Outcome::failed(&ManagerError::PoolFull));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["a"][0], serde_json::json!({"status": "succeeded"}));
        assert_eq!(json["b"][0]["warning"], "console not opened");
        assert_eq!(json["c"][0]["status"], "failed");
        assert_eq!(json["c"][0]["error"], "pool_full");

        let back: BulkResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
