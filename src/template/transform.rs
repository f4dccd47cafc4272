use std::sync::LazyLock;

use regex::Regex;

use super::TemplateSyntaxError;
use crate::extract::FieldValue;

static DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*(?:\((.*)\))?$").unwrap());

/// What a placeholder consumes from the line before its transforms run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// A single whitespace-free token.
    Token,
    /// Everything up to the end of the line.
    Remainder,
    /// Nothing: the placeholder only records that the line was seen.
    Presence,
}

impl Capture {
    pub fn pattern(self) -> Option<&'static str> {
        match self {
            Capture::Token => Some(r"(\S+)"),
            Capture::Remainder => Some(r"(.*)"),
            Capture::Presence => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Transform {
    /// `line`: capture the rest of the line verbatim.
    Line,
    /// `set(V)`: presence flag, records `V` whatever the line held.
    Set(FieldValue),
    /// `re("P")`: first capture group of `P`, or the whole match.
    Re(Regex),
    Lower,
    Upper,
    Strip,
    ToInt,
}

impl Transform {
    /// Parse one directive such as `set(True)` or `re(".*")`.
    pub fn parse(directive: &str, line: usize) -> Result<Transform, TemplateSyntaxError> {
        let caps = DIRECTIVE_RE.captures(directive.trim()).ok_or_else(|| {
            TemplateSyntaxError::Malformed {
                line,
                message: format!("cannot parse transform '{}'", directive.trim()),
            }
        })?;
        let name = &caps[1];
        let arg = caps.get(2).map(|m| unquote(m.as_str().trim()));

        let transform = match (name, arg) {
            ("line", None) => Transform::Line,
            ("lower", None) => Transform::Lower,
            ("upper", None) => Transform::Upper,
            ("strip", None) => Transform::Strip,
            ("to_int", None) => Transform::ToInt,
            ("set", Some(arg)) => Transform::Set(literal(arg)),
            ("re", Some(arg)) => {
                let re = Regex::new(arg).map_err(|e| TemplateSyntaxError::BadRegex {
                    line,
                    message: e.to_string(),
                })?;
                Transform::Re(re)
            }
            ("line" | "lower" | "upper" | "strip" | "to_int", Some(_)) => {
                return Err(TemplateSyntaxError::Malformed {
                    line,
                    message: format!("transform '{}' takes no argument", name),
                })
            }
            ("set" | "re", None) => {
                return Err(TemplateSyntaxError::Malformed {
                    line,
                    message: format!("transform '{}' requires an argument", name),
                })
            }
            _ => {
                return Err(TemplateSyntaxError::UnknownTransform {
                    line,
                    name: name.to_string(),
                })
            }
        };
        Ok(transform)
    }

    /// Apply to a value; `None` means the field does not match this line.
    pub fn apply(&self, value: FieldValue) -> Option<FieldValue> {
        match (self, value) {
            (Transform::Set(v), _) => Some(v.clone()),
            (Transform::Line, v) => Some(v),
            (Transform::Re(re), FieldValue::Text(s)) => {
                let caps = re.captures(&s)?;
                let m = caps.get(1).or_else(|| caps.get(0))?;
                Some(FieldValue::Text(m.as_str().to_string()))
            }
            (Transform::Lower, FieldValue::Text(s)) => Some(FieldValue::Text(s.to_lowercase())),
            (Transform::Upper, FieldValue::Text(s)) => Some(FieldValue::Text(s.to_uppercase())),
            (Transform::Strip, FieldValue::Text(s)) => Some(FieldValue::Text(s.trim().to_string())),
            (Transform::ToInt, FieldValue::Text(s)) => s.trim().parse().ok().map(FieldValue::Int),
            (Transform::ToInt, v @ FieldValue::Int(_)) => Some(v),
            (Transform::ToInt, FieldValue::Flag(_)) => None,
            (_, v) => Some(v),
        }
    }
}

/// Capture shape implied by a transform chain. `set` wins over everything;
/// `line` and `re` widen the capture to the remainder of the line.
pub fn capture_for(chain: &[Transform]) -> Capture {
    if chain.iter().any(|t| matches!(t, Transform::Set(_))) {
        Capture::Presence
    } else if chain
        .iter()
        .any(|t| matches!(t, Transform::Line | Transform::Re(_)))
    {
        Capture::Remainder
    } else {
        Capture::Token
    }
}

fn unquote(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn literal(arg: &str) -> FieldValue {
    match arg {
        "True" | "true" => FieldValue::Flag(true),
        "False" | "false" => FieldValue::Flag(false),
        _ => arg
            .parse::<i64>()
            .map(FieldValue::Int)
            .unwrap_or_else(|_| FieldValue::Text(arg.to_string())),
    }
}
