use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar written into a record by a field pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, FieldValue::Flag(true))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Flag(b) => write!(f, "{}", b),
            FieldValue::Int(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// One instance of a group: its own fields plus the instances of its child
/// groups, keyed by child group name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Record {
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(flatten)]
    pub groups: BTreeMap<String, Vec<Record>>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_str)
    }

    /// True only for an explicit `true` flag; absent fields read as false.
    pub fn flag(&self, field: &str) -> bool {
        self.get(field).is_some_and(FieldValue::is_true)
    }
}

/// Output of one extraction run: top-level group name → instances in input
/// order. Every group is a sequence, even when it matched once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExtractionResult {
    pub groups: BTreeMap<String, Vec<Record>>,
}

impl ExtractionResult {
    pub fn group(&self, name: &str) -> &[Record] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&Record> {
        self.group(name).first()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }
}
