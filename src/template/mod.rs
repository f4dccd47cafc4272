mod compile;
pub mod transform;

use regex::Regex;
use thiserror::Error;

use crate::extract::FieldValue;
use transform::Transform;

/// Placeholder name that turns a field line into a group terminator.
pub const END_MARKER: &str = "_end_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateSyntaxError {
    #[error("line {line}: unknown transform '{name}'")]
    UnknownTransform { line: usize, name: String },

    #[error("line {line}: field line has no placeholder: {text}")]
    MissingPlaceholder { line: usize, text: String },

    #[error("line {line}: unbalanced group nesting: {detail}")]
    Unbalanced { line: usize, detail: String },

    #[error("line {line}: group '{name}' has no start line")]
    EmptyGroup { line: usize, name: String },

    #[error("line {line}: field line outside of any group")]
    OutsideGroup { line: usize },

    #[error("line {line}: invalid regular expression: {message}")]
    BadRegex { line: usize, message: String },

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub transforms: Vec<Transform>,
    /// Capture group index in the line regex; `None` for presence flags.
    group: Option<usize>,
}

/// One compiled template line.
#[derive(Debug, Clone)]
pub struct FieldPattern {
    pub line: usize,
    pub source: String,
    regex: Regex,
    vars: Vec<Variable>,
}

impl FieldPattern {
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Match a whole input line and run every variable's transform chain.
    /// Returns `None` if the line does not match or any transform rejects
    /// its capture.
    pub fn captures<'p>(&'p self, line: &str) -> Option<Vec<(&'p str, FieldValue)>> {
        let caps = self.regex.captures(line)?;
        let mut out = Vec::with_capacity(self.vars.len());
        for var in &self.vars {
            let raw = var
                .group
                .and_then(|i| caps.get(i))
                .map(|m| m.as_str())
                .unwrap_or("");
            let value = var
                .transforms
                .iter()
                .try_fold(FieldValue::Text(raw.to_string()), |v, t| t.apply(v))?;
            out.push((var.name.as_str(), value));
        }
        Some(out)
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub line: usize,
    pub start: FieldPattern,
    pub fields: Vec<FieldPattern>,
    pub end: Option<FieldPattern>,
    pub children: Vec<Group>,
}

impl Group {
    /// Depth of the deepest chain of groups rooted here (a leaf is 1).
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Group::depth).max().unwrap_or(0)
    }
}

/// A compiled template. Immutable; share it by reference across workers.
#[derive(Debug, Clone)]
pub struct Template {
    groups: Vec<Group>,
}

impl Template {
    pub fn compile(text: &str) -> Result<Template, TemplateSyntaxError> {
        let groups = compile::compile(text)?;
        Ok(Template { groups })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn depth(&self) -> usize {
        self.groups.iter().map(Group::depth).max().unwrap_or(0)
    }
}
