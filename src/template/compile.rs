use std::borrow::Cow;
use std::sync::LazyLock;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use super::transform::{capture_for, Transform};
use super::{FieldPattern, Group, TemplateSyntaxError, Variable, END_MARKER};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static TAG_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*</?[A-Za-z][^<>]*>\s*$").unwrap());

/// A group whose closing tag has not been seen yet.
struct OpenGroup {
    name: String,
    line: usize,
    start: Option<FieldPattern>,
    fields: Vec<FieldPattern>,
    end: Option<FieldPattern>,
    children: Vec<Group>,
}

impl OpenGroup {
    fn new(name: String, line: usize) -> Self {
        OpenGroup {
            name,
            line,
            start: None,
            fields: Vec::new(),
            end: None,
            children: Vec::new(),
        }
    }

    fn add(&mut self, pattern: FieldPattern, is_end: bool) -> Result<(), TemplateSyntaxError> {
        if is_end {
            if self.end.is_some() {
                return Err(TemplateSyntaxError::Malformed {
                    line: pattern.line,
                    message: format!("group '{}' already has an end line", self.name),
                });
            }
            self.end = Some(pattern);
        } else if self.start.is_none() {
            self.start = Some(pattern);
        } else {
            self.fields.push(pattern);
        }
        Ok(())
    }

    fn finish(self) -> Result<Group, TemplateSyntaxError> {
        let start = self.start.ok_or_else(|| TemplateSyntaxError::EmptyGroup {
            line: self.line,
            name: self.name.clone(),
        })?;
        Ok(Group {
            name: self.name,
            line: self.line,
            start,
            fields: self.fields,
            end: self.end,
            children: self.children,
        })
    }
}

/// Parse template text into its top-level groups.
///
/// ```text
/// <group name="interfaces">
/// interface {{ interface_name }}
///  description {{ description | re(".*") }}
///  switchport mode access {{ is_access_port | set(True) }}
/// ! {{ _end_ }}
/// </group>
/// ```
///
/// Group tags must sit on a line of their own. Every other non-blank line is
/// a field line taken literally (`&` and `<` included); `##` starts a comment.
pub(super) fn compile(text: &str) -> Result<Vec<Group>, TemplateSyntaxError> {
    let text = escape_field_lines(text);
    let text = text.as_str();
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<OpenGroup> = Vec::new();
    let mut top: Vec<Group> = Vec::new();

    loop {
        let line = line_at(text, reader.buffer_position() as usize);
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = group_name(&e, line)?;
                stack.push(OpenGroup::new(name, line));
            }
            Ok(Event::Empty(e)) => {
                let name = group_name(&e, line)?;
                return Err(TemplateSyntaxError::EmptyGroup { line, name });
            }
            Ok(Event::End(_)) => {
                let open = stack.pop().ok_or_else(|| TemplateSyntaxError::Unbalanced {
                    line,
                    detail: "closing tag without an open group".into(),
                })?;
                let group = open.finish()?;
                attach(&mut stack, &mut top, group, line)?;
            }
            Ok(Event::Text(e)) => {
                let body = e.unescape().map_err(|err| TemplateSyntaxError::Malformed {
                    line,
                    message: err.to_string(),
                })?;
                for (offset, raw) in body.split('\n').enumerate() {
                    add_text_line(&mut stack, line + offset, raw)?;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                let line = line_at(text, reader.buffer_position() as usize);
                return Err(xml_error(err, line));
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(TemplateSyntaxError::Unbalanced {
            line: open.line,
            detail: format!("group '{}' is never closed", open.name),
        });
    }
    Ok(top)
}

/// Escape everything but tag lines so the markup reader hands field text back
/// unchanged. Line breaks are kept, so positions still map to source lines.
fn escape_field_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let line: Cow<str> = if TAG_LINE_RE.is_match(line) {
            Cow::Borrowed(line)
        } else {
            escape(line)
        };
        out.push_str(&line);
    }
    out
}

fn line_at(text: &str, pos: usize) -> usize {
    let pos = pos.min(text.len());
    1 + text.as_bytes()[..pos].iter().filter(|&&b| b == b'\n').count()
}

fn xml_error(err: quick_xml::Error, line: usize) -> TemplateSyntaxError {
    match err {
        quick_xml::Error::IllFormed(inner) => TemplateSyntaxError::Unbalanced {
            line,
            detail: inner.to_string(),
        },
        other => TemplateSyntaxError::Malformed {
            line,
            message: other.to_string(),
        },
    }
}

fn group_name(e: &BytesStart, line: usize) -> Result<String, TemplateSyntaxError> {
    let malformed = |message: String| TemplateSyntaxError::Malformed { line, message };

    if e.name().as_ref() != b"group" {
        return Err(malformed(format!(
            "unknown tag <{}>",
            String::from_utf8_lossy(e.name().as_ref())
        )));
    }

    let mut name = None;
    for attr in e.attributes() {
        let attr = attr.map_err(|err| malformed(err.to_string()))?;
        if attr.key.as_ref() != b"name" {
            return Err(malformed(format!(
                "unsupported group attribute '{}'",
                String::from_utf8_lossy(attr.key.as_ref())
            )));
        }
        let value = attr.unescape_value().map_err(|err| malformed(err.to_string()))?;
        name = Some(value.trim().to_string());
    }

    match name {
        Some(n) if NAME_RE.is_match(&n) => Ok(n),
        Some(n) => Err(malformed(format!("invalid group name '{}'", n))),
        None => Err(malformed("group is missing a name".into())),
    }
}

fn attach(
    stack: &mut [OpenGroup],
    top: &mut Vec<Group>,
    group: Group,
    line: usize,
) -> Result<(), TemplateSyntaxError> {
    let siblings = match stack.last_mut() {
        Some(parent) => &mut parent.children,
        None => top,
    };
    if siblings.iter().any(|g| g.name == group.name) {
        return Err(TemplateSyntaxError::Malformed {
            line,
            message: format!("duplicate group '{}' at the same level", group.name),
        });
    }
    siblings.push(group);
    Ok(())
}

fn add_text_line(
    stack: &mut [OpenGroup],
    line: usize,
    raw: &str,
) -> Result<(), TemplateSyntaxError> {
    let text = raw.trim();
    if text.is_empty() || text.starts_with("##") {
        return Ok(());
    }
    let open = stack
        .last_mut()
        .ok_or(TemplateSyntaxError::OutsideGroup { line })?;
    let (pattern, is_end) = compile_line(text, line)?;
    open.add(pattern, is_end)
}

enum Token<'a> {
    Literal(&'a str),
    Space,
    Capture(&'static str),
}

/// Compile one field line into an anchored regex plus its variables.
fn compile_line(text: &str, line: usize) -> Result<(FieldPattern, bool), TemplateSyntaxError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut vars = Vec::new();
    let mut is_end = false;
    let mut found = false;
    let mut last = 0;
    let mut next_group = 0;

    for caps in PLACEHOLDER_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        push_literal(&mut tokens, &text[last..whole.start()]);
        last = whole.end();
        found = true;

        let mut parts = split_directives(&caps[1]).into_iter();
        let name = parts.next().unwrap_or_default();
        if !NAME_RE.is_match(&name) {
            return Err(TemplateSyntaxError::Malformed {
                line,
                message: format!("invalid variable name '{}'", name),
            });
        }

        if name == END_MARKER {
            if parts.next().is_some() {
                return Err(TemplateSyntaxError::Malformed {
                    line,
                    message: format!("'{}' takes no transforms", END_MARKER),
                });
            }
            is_end = true;
            continue;
        }

        let transforms = parts
            .map(|d| Transform::parse(&d, line))
            .collect::<Result<Vec<_>, _>>()?;
        let group = capture_for(&transforms).pattern().map(|p| {
            tokens.push(Token::Capture(p));
            next_group += 1;
            next_group
        });
        vars.push(Variable {
            name,
            transforms,
            group,
        });
    }

    if !found {
        return Err(TemplateSyntaxError::MissingPlaceholder {
            line,
            text: text.to_string(),
        });
    }
    push_literal(&mut tokens, &text[last..]);

    let mut pattern = String::from(r"^\s*");
    let mut emitted = false;
    let mut pending_space = false;
    for token in &tokens {
        match token {
            Token::Space => pending_space = emitted,
            Token::Literal(word) => {
                if pending_space {
                    pattern.push_str(r"\s+");
                }
                pattern.push_str(&regex::escape(word));
                emitted = true;
                pending_space = false;
            }
            Token::Capture(p) => {
                if pending_space {
                    pattern.push_str(r"\s+");
                }
                pattern.push_str(p);
                emitted = true;
                pending_space = false;
            }
        }
    }
    if !emitted {
        return Err(TemplateSyntaxError::Malformed {
            line,
            message: "field line has nothing to match".into(),
        });
    }
    pattern.push_str(r"\s*$");

    let regex = Regex::new(&pattern).map_err(|e| TemplateSyntaxError::BadRegex {
        line,
        message: e.to_string(),
    })?;

    Ok((
        FieldPattern {
            line,
            source: text.to_string(),
            regex,
            vars,
        },
        is_end,
    ))
}

fn push_literal<'a>(tokens: &mut Vec<Token<'a>>, s: &'a str) {
    let mut rest = s;
    while !rest.is_empty() {
        let ws = rest.len() - rest.trim_start().len();
        if ws > 0 {
            tokens.push(Token::Space);
            rest = &rest[ws..];
            continue;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        tokens.push(Token::Literal(&rest[..end]));
        rest = &rest[end..];
    }
}

/// Split `name | a | re("x|y")` on pipes that sit outside quotes and parens.
fn split_directives(inner: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in inner.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                '|' if depth == 0 => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    parts.push(current);
    parts.into_iter().map(|p| p.trim().to_string()).collect()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::FieldValue;
    use crate::template::Template;

    const DOT1X: &str = include_str!("../../templates/dot1x.ttp");

    fn err(text: &str) -> TemplateSyntaxError {
        Template::compile(text).unwrap_err()
    }

    #[test]
    fn bundled_template_compiles() {
        let t = Template::compile(DOT1X).unwrap();
        let names: Vec<&str> = t.groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["metadata", "interfaces"]);
        let intf = &t.groups()[1];
        assert_eq!(intf.start.source, "interface {{ interface_name }}");
        assert!(intf.fields.len() >= 4);
    }

    #[test]
    fn nested_groups_and_end_marker() {
        let t = Template::compile(
            "<group name=\"vlans\">\nvlan {{ id | to_int }}\n name {{ name }}\n<group name=\"ports\">\n  port {{ port }}\n</group>\n! {{ _end_ }}\n</group>\n",
        )
        .unwrap();
        let vlans = &t.groups()[0];
        assert_eq!(vlans.children.len(), 1);
        assert_eq!(vlans.children[0].name, "ports");
        assert!(vlans.end.as_ref().unwrap().is_match("!"));
        assert_eq!(t.depth(), 2);
    }

    #[test]
    fn whitespace_and_indentation_are_flexible() {
        let t = Template::compile("<group name=\"g\">\n   ip address {{ ip }}   {{ mask }}\n</group>").unwrap();
        let start = &t.groups()[0].start;
        let got = start.captures("  ip  address 10.0.0.1 255.255.255.0").unwrap();
        assert_eq!(got[0], ("ip", FieldValue::Text("10.0.0.1".into())));
        assert_eq!(got[1], ("mask", FieldValue::Text("255.255.255.0".into())));
        assert!(start.captures("ip address 10.0.0.1").is_none());
    }

    #[test]
    fn literal_metacharacters_are_escaped() {
        let t = Template::compile("<group name=\"g\">\nspeed (auto) {{ v }}\n</group>").unwrap();
        assert!(t.groups()[0].start.is_match("speed (auto) 100"));
        assert!(!t.groups()[0].start.is_match("speed auto 100"));
    }

    #[test]
    fn ampersand_and_angle_bracket_are_plain_text() {
        let t = Template::compile(
            "<group name=\"g\">\ndescription {{ d | re(\"R&D.*\") }}\n cost a<b {{ c }}\n</group>\n",
        )
        .unwrap();
        let g = &t.groups()[0];
        assert_eq!(g.start.source, r#"description {{ d | re("R&D.*") }}"#);
        assert_eq!(
            g.start.captures("description R&D lab").unwrap(),
            vec![("d", FieldValue::Text("R&D lab".into()))]
        );
        assert_eq!(g.fields[0].line, 3);
        assert!(g.fields[0].is_match(" cost a<b 5"));
    }

    #[test]
    fn presence_flag_consumes_nothing() {
        let t = Template::compile(
            "<group name=\"g\">\nswitchport mode access {{ access | set(True) }}\n</group>",
        )
        .unwrap();
        let start = &t.groups()[0].start;
        assert_eq!(
            start.captures(" switchport mode access").unwrap(),
            vec![("access", FieldValue::Flag(true))]
        );
        assert!(start.captures(" switchport mode access vlan").is_none());
    }

    #[test]
    fn pipe_inside_regex_argument() {
        assert_eq!(
            split_directives(r#" d | re("a|b") | lower "#),
            vec!["d", r#"re("a|b")"#, "lower"]
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let t = Template::compile("## header\n<group name=\"g\">\n\n## note\nhostname {{ h }}\n</group>\n").unwrap();
        assert_eq!(t.groups()[0].start.line, 5);
        assert!(t.groups()[0].fields.is_empty());
    }

    #[test]
    fn unknown_transform() {
        assert!(matches!(
            err("<group name=\"g\">\nhostname {{ h | shout }}\n</group>"),
            TemplateSyntaxError::UnknownTransform { line: 2, .. }
        ));
    }

    #[test]
    fn missing_placeholder() {
        assert!(matches!(
            err("<group name=\"g\">\nhostname {{ h }}\n no shutdown\n</group>"),
            TemplateSyntaxError::MissingPlaceholder { line: 3, .. }
        ));
    }

    #[test]
    fn unclosed_group() {
        assert!(matches!(
            err("<group name=\"g\">\nhostname {{ h }}\n"),
            TemplateSyntaxError::Unbalanced { .. }
        ));
    }

    #[test]
    fn stray_closing_tag() {
        assert!(matches!(
            err("<group name=\"g\">\nhostname {{ h }}\n</group>\n</group>\n"),
            TemplateSyntaxError::Unbalanced { .. }
        ));
    }

    #[test]
    fn mismatched_closing_tag() {
        assert!(matches!(
            err("<group name=\"g\">\nhostname {{ h }}\n</grp>\n"),
            TemplateSyntaxError::Unbalanced { .. }
        ));
    }

    #[test]
    fn field_outside_group() {
        assert_eq!(
            err("hostname {{ h }}\n"),
            TemplateSyntaxError::OutsideGroup { line: 1 }
        );
    }

    #[test]
    fn group_without_lines() {
        assert!(matches!(
            err("<group name=\"g\">\n</group>"),
            TemplateSyntaxError::EmptyGroup { .. }
        ));
        assert!(matches!(
            err("<group name=\"g\"/>"),
            TemplateSyntaxError::EmptyGroup { .. }
        ));
    }

    #[test]
    fn bad_group_markup() {
        assert!(matches!(
            err("<group>\nx {{ y }}\n</group>"),
            TemplateSyntaxError::Malformed { .. }
        ));
        assert!(matches!(
            err("<group name=\"g\" method=\"table\">\nx {{ y }}\n</group>"),
            TemplateSyntaxError::Malformed { .. }
        ));
        assert!(matches!(
            err("<section name=\"g\">\nx {{ y }}\n</section>"),
            TemplateSyntaxError::Malformed { .. }
        ));
    }

    #[test]
    fn duplicate_sibling_groups() {
        assert!(matches!(
            err("<group name=\"g\">\na {{ x }}\n</group>\n<group name=\"g\">\nb {{ y }}\n</group>"),
            TemplateSyntaxError::Malformed { .. }
        ));
    }

    #[test]
    fn compile_is_deterministic() {
        let a = Template::compile(DOT1X).unwrap();
        let b = Template::compile(DOT1X).unwrap();
        let sources = |t: &Template| -> Vec<String> {
            t.groups()
                .iter()
                .flat_map(|g| std::iter::once(&g.start).chain(&g.fields))
                .map(|p| p.regex.as_str().to_string())
                .collect()
        };
        assert_eq!(sources(&a), sources(&b));
    }
}
