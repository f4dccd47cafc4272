mod record;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::template::{Group, Template};
pub use record::{ExtractionResult, FieldValue, Record};

pub const DEFAULT_MAX_DEPTH: usize = 16;

static LINE_BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r\n|\r|\n").unwrap());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("input is not valid UTF-8 (invalid byte at offset {offset})")]
    MalformedInputEncoding { offset: usize },

    #[error("line {line}: opening group '{group}' exceeds maximum nesting depth {limit}")]
    MatchDepthExceeded {
        line: usize,
        group: String,
        limit: usize,
    },
}

/// Runs a shared template over documents. Cheap to construct; holds no
/// per-document state.
///
/// Per line, at the innermost open group:
/// 1. its end pattern closes the frame,
/// 2. its field patterns (declaration order, first match wins) fill the
///    current instance,
/// 3. its children's start patterns open a new child instance,
/// 4. a line indented no deeper than the line that opened the group closes
///    the group and is retried one level up.
///
/// Anything else is ignored.
#[derive(Debug, Clone, Copy)]
pub struct Extractor<'t> {
    template: &'t Template,
    max_depth: usize,
}

struct Slot<'t> {
    group: &'t Group,
    fields: BTreeMap<String, FieldValue>,
    children: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Frame<'t> {
    group: &'t Group,
    slot: usize,
    indent: usize,
}

#[derive(Default)]
struct State<'t> {
    slots: Vec<Slot<'t>>,
    roots: Vec<usize>,
    stack: Vec<Frame<'t>>,
}

impl<'t> State<'t> {
    fn write(&mut self, slot: usize, values: Vec<(&str, FieldValue)>) {
        let fields = &mut self.slots[slot].fields;
        for (name, value) in values {
            fields.insert(name.to_string(), value);
        }
    }

    fn open(&mut self, group: &'t Group, indent: usize, values: Vec<(&str, FieldValue)>) {
        let slot = self.slots.len();
        self.slots.push(Slot {
            group,
            fields: BTreeMap::new(),
            children: Vec::new(),
        });
        match self.stack.last() {
            Some(parent) => self.slots[parent.slot].children.push(slot),
            None => self.roots.push(slot),
        }
        self.write(slot, values);
        self.stack.push(Frame {
            group,
            slot,
            indent,
        });
    }

    fn assemble(mut self) -> ExtractionResult {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        let roots = std::mem::take(&mut self.roots);
        for idx in roots {
            let name = self.slots[idx].group.name.clone();
            let record = self.build(idx);
            groups.entry(name).or_default().push(record);
        }
        ExtractionResult { groups }
    }

    fn build(&mut self, idx: usize) -> Record {
        let fields = std::mem::take(&mut self.slots[idx].fields);
        let children = std::mem::take(&mut self.slots[idx].children);
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for child in children {
            let name = self.slots[child].group.name.clone();
            let record = self.build(child);
            groups.entry(name).or_default().push(record);
        }
        Record { fields, groups }
    }
}

impl<'t> Extractor<'t> {
    pub fn new(template: &'t Template, max_depth: usize) -> Self {
        Extractor {
            template,
            max_depth,
        }
    }

    /// Extract from raw bytes. Fails only on invalid UTF-8 or when nesting
    /// exceeds `max_depth`; unmatched lines are skipped.
    pub fn extract(&self, input: &[u8]) -> Result<ExtractionResult, ExtractError> {
        let text = std::str::from_utf8(input).map_err(|e| ExtractError::MalformedInputEncoding {
            offset: e.valid_up_to(),
        })?;
        self.extract_str(text)
    }

    pub fn extract_str(&self, text: &str) -> Result<ExtractionResult, ExtractError> {
        let lines: Vec<&str> = LINE_BREAK_RE.split(text).collect();
        let mut state = State::default();

        for (idx, raw) in lines.iter().enumerate() {
            let line = raw.trim_end();
            let body = line.trim_start();
            if body.is_empty() {
                continue;
            }
            let indent = line.len() - body.len();
            self.feed(&mut state, line, indent, idx + 1)?;
        }

        // End of input closes every open frame.
        state.stack.clear();
        Ok(state.assemble())
    }

    fn feed(
        &self,
        state: &mut State<'t>,
        line: &str,
        indent: usize,
        lineno: usize,
    ) -> Result<(), ExtractError> {
        loop {
            let top = state.stack.last().copied();
            let children = match top {
                Some(frame) => {
                    if frame.group.end.as_ref().is_some_and(|p| p.is_match(line)) {
                        state.stack.pop();
                        return Ok(());
                    }
                    for pattern in &frame.group.fields {
                        if let Some(values) = pattern.captures(line) {
                            state.write(frame.slot, values);
                            return Ok(());
                        }
                    }
                    frame.group.children.as_slice()
                }
                None => self.template.groups(),
            };

            for child in children {
                if let Some(values) = child.start.captures(line) {
                    if state.stack.len() >= self.max_depth {
                        return Err(ExtractError::MatchDepthExceeded {
                            line: lineno,
                            group: child.name.clone(),
                            limit: self.max_depth,
                        });
                    }
                    state.open(child, indent, values);
                    return Ok(());
                }
            }

            match top {
                Some(frame) if indent <= frame.indent => {
                    state.stack.pop();
                }
                _ => return Ok(()),
            }
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const DOT1X: &str = include_str!("../../templates/dot1x.ttp");

    fn run(template: &str, input: &str) -> ExtractionResult {
        let t = Template::compile(template).unwrap();
        Extractor::new(&t, DEFAULT_MAX_DEPTH).extract_str(input).unwrap()
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn metadata_and_repeated_interfaces() {
        let input = std::fs::read_to_string("tests/fixtures/access-sw1.cfg").unwrap();
        let r = run(DOT1X, &input);

        assert_eq!(r.group("metadata").len(), 1);
        assert_eq!(r.first("metadata").unwrap().text("hostname"), Some("access-sw1"));

        let intfs = r.group("interfaces");
        let names: Vec<_> = intfs.iter().filter_map(|i| i.text("interface_name")).collect();
        assert_eq!(
            names,
            vec![
                "GigabitEthernet1/0/1",
                "GigabitEthernet1/0/2",
                "GigabitEthernet1/0/3",
                "GigabitEthernet1/0/48",
                "Vlan10"
            ]
        );
        assert!(intfs[0].flag("is_access_port"));
        assert!(!intfs[0].flag("dot1x_enabled"));
        assert!(intfs[1].flag("dot1x_enabled"));
        assert!(intfs[1].flag("dot1x_control"));
        assert_eq!(intfs[2].text("description"), Some("Lab printer 802.1x exempt"));
        assert_eq!(intfs[0].get("access_vlan"), Some(&FieldValue::Int(20)));
        assert!(intfs[3].flag("is_trunk_port"));
        assert!(!intfs[4].flag("is_access_port"));
    }

    #[test]
    fn unmodeled_lines_do_not_leak_into_previous_group() {
        let input = "interface Gi1\n description one\n!\nline vty 0 4\n description not-an-interface\n";
        let r = run(DOT1X, input);
        let intfs = r.group("interfaces");
        assert_eq!(intfs.len(), 1);
        assert_eq!(intfs[0].text("description"), Some("one"));
    }

    #[test]
    fn first_declared_field_wins() {
        let template = "<group name=\"g\">\nitem {{ id }}\n value {{ first }}\n value {{ second }}\n</group>";
        let r = run(template, "item a\n value 1\n");
        let rec = &r.group("g")[0];
        assert_eq!(rec.get("first"), Some(&text("1")));
        assert!(rec.get("second").is_none());
    }

    #[test]
    fn failing_transform_falls_through_to_next_field() {
        let template = "<group name=\"g\">\nitem {{ id }}\n value {{ num | to_int }}\n value {{ word }}\n</group>";
        let r = run(template, "item a\n value 7\nitem b\n value seven\n");
        let g = r.group("g");
        assert_eq!(g[0].get("num"), Some(&FieldValue::Int(7)));
        assert_eq!(g[1].get("word"), Some(&text("seven")));
        assert!(g[1].get("num").is_none());
    }

    #[test]
    fn nested_groups_build_nested_records() {
        let template = "<group name=\"vlans\">\nvlan {{ id | to_int }}\n name {{ name }}\n<group name=\"ports\">\n port {{ port }}\n  mode {{ mode }}\n</group>\n</group>";
        let input = "vlan 10\n name users\n port Gi1\n  mode access\n port Gi2\nvlan 20\n name voice\n";
        let r = run(template, input);
        let vlans = r.group("vlans");
        assert_eq!(vlans.len(), 2);
        assert_eq!(vlans[0].get("id"), Some(&FieldValue::Int(10)));
        let ports = &vlans[0].groups["ports"];
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].text("mode"), Some("access"));
        assert!(ports[1].get("mode").is_none());
        assert_eq!(vlans[1].text("name"), Some("voice"));
        assert!(!vlans[1].groups.contains_key("ports"));
    }

    #[test]
    fn explicit_end_marker_closes_scope() {
        let template = "<group name=\"blk\">\nbegin {{ id }}\n{{ key }} = {{ value }}\nend {{ _end_ }}\n</group>";
        let input = "begin a\nx = 1\nend\ny = 2\n";
        let r = run(template, input);
        let blk = &r.group("blk")[0];
        assert_eq!(blk.text("key"), Some("x"));
        assert_eq!(blk.text("value"), Some("1"));
    }

    #[test]
    fn flat_groups_keep_same_indent_fields() {
        let template = "<group name=\"ver\">\nCisco IOS Software, Version {{ version | strip }}\nuptime is {{ uptime | line }}\n</group>";
        let input = "Cisco IOS Software, Version 17.3.4\nuptime is 3 weeks, 2 days\n";
        let r = run(template, input);
        let v = &r.group("ver")[0];
        assert_eq!(v.text("version"), Some("17.3.4"));
        assert_eq!(v.text("uptime"), Some("3 weeks, 2 days"));
    }

    #[test]
    fn crlf_line_endings() {
        let r = run(DOT1X, "hostname sw9\r\ninterface Gi1\r\n switchport mode access\r\n");
        assert_eq!(r.first("metadata").unwrap().text("hostname"), Some("sw9"));
        assert!(r.group("interfaces")[0].flag("is_access_port"));
    }

    #[test]
    fn bare_cr_and_mixed_line_endings() {
        let r = run(DOT1X, "interface Gi1\r description one\rinterface Gi2\r\n switchport mode access\n");
        let intfs = r.group("interfaces");
        assert_eq!(intfs.len(), 2);
        assert_eq!(intfs[0].text("description"), Some("one"));
        assert!(!intfs[0].flag("is_access_port"));
        assert!(intfs[1].flag("is_access_port"));
    }

    #[test]
    fn single_match_is_still_a_sequence() {
        let r = run(DOT1X, "interface Gi1\n");
        assert_eq!(r.group("interfaces").len(), 1);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json["interfaces"].is_array());
    }

    #[test]
    fn empty_input_yields_empty_result() {
        let r = run(DOT1X, "");
        assert!(r.is_empty());
        assert!(r.group("interfaces").is_empty());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let t = Template::compile(DOT1X).unwrap();
        let err = Extractor::new(&t, DEFAULT_MAX_DEPTH)
            .extract(b"hostname sw1\n\xff\xfe\n")
            .unwrap_err();
        assert_eq!(err, ExtractError::MalformedInputEncoding { offset: 13 });
    }

    #[test]
    fn depth_limit() {
        let template = "<group name=\"a\">\na {{ x }}\n<group name=\"b\">\n b {{ y }}\n<group name=\"c\">\n  c {{ z }}\n</group>\n</group>\n</group>";
        let t = Template::compile(template).unwrap();
        let input = "a 1\n b 2\n  c 3\n";
        assert!(Extractor::new(&t, 3).extract_str(input).is_ok());
        let err = Extractor::new(&t, 2).extract_str(input).unwrap_err();
        assert_eq!(
            err,
            ExtractError::MatchDepthExceeded {
                line: 3,
                group: "c".into(),
                limit: 2
            }
        );
    }

    #[test]
    fn extraction_is_deterministic() {
        let input = std::fs::read_to_string("tests/fixtures/access-sw1.cfg").unwrap();
        let t = Template::compile(DOT1X).unwrap();
        let ex = Extractor::new(&t, DEFAULT_MAX_DEPTH);
        assert_eq!(ex.extract_str(&input).unwrap(), ex.extract_str(&input).unwrap());
    }
}
