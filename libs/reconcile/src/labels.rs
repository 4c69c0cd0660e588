//! Capability labels.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a label-set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelSetError {
    #[error("label must not be empty")]
    Empty,

    #[error("invalid character {ch:?} in label {label:?}")]
    InvalidChar { label: String, ch: char },
}

/// A set of capability tags a node satisfies.
///
/// Labels are kept sorted so that two label-sets with the same members
/// compare, hash and display identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    /// Create an empty label-set (satisfied by every node).
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Build a label-set from individual labels, validating each.
    pub fn from_labels<I, S>(labels: I) -> Result<Self, LabelSetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for label in labels {
            let label = label.as_ref().trim();
            validate_label(label)?;
            set.insert(label.to_string());
        }
        Ok(Self(set))
    }

    /// Returns true if a node carrying `self` can serve demand for `required`.
    pub fn satisfies(&self, required: &LabelSet) -> bool {
        self.0.is_superset(&required.0)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

fn validate_label(label: &str) -> Result<(), LabelSetError> {
    if label.is_empty() {
        return Err(LabelSetError::Empty);
    }
    if let Some(ch) = label
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')))
    {
        return Err(LabelSetError::InvalidChar {
            label: label.to_string(),
            ch,
        });
    }
    Ok(())
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(","))
    }
}

/// Parses a comma separated list, e.g. `linux,x86_64,gpu`.
impl FromStr for LabelSet {
    type Err = LabelSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::new());
        }
        Self::from_labels(s.split(','))
    }
}

impl TryFrom<Vec<String>> for LabelSet {
    type Error = LabelSetError;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        Self::from_labels(labels)
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(set: LabelSet) -> Self {
        set.0.into_iter().collect()
    }
}
