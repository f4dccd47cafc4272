use super::{Predicate, Reason, Rule};

pub const RULE_ID: &str = "dot1x_compliance";
pub const RULE_NAME: &str = "802.1X Access Port Compliance";

pub const DEFAULT_EXEMPTION_PHRASES: &[&str] = &["exempt"];

/// Bundled extraction template for this rule.
pub const TEMPLATE: &str = include_str!("../../templates/dot1x.ttp");

pub fn rule(exemption_phrases: &[String]) -> Rule {
    let phrases: Vec<String> = exemption_phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    Rule::new(
        RULE_ID,
        RULE_NAME,
        "802.1X",
        Predicate::new("access", |r| r.flag("is_access_port")),
    )
    .conflicting(Predicate::new("trunk", |r| r.flag("is_trunk_port")))
    .exempt_when(
        Predicate::new("control_enabled", |r| {
            r.flag("dot1x_enabled") || r.flag("dot1x_control")
        }),
        Reason::ControlEnabled,
    )
    .exempt_when(
        Predicate::new("exemption_phrase", move |r| {
            let description = r.text("description").unwrap_or("").to_lowercase();
            phrases.iter().any(|p| description.contains(p.as_str()))
        }),
        Reason::Exemption,
    )
}

pub fn default_phrases() -> Vec<String> {
    DEFAULT_EXEMPTION_PHRASES.iter().map(|s| s.to_string()).collect()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::{evaluate, Verdict};
    use crate::extract::{Extractor, FieldValue, Record, DEFAULT_MAX_DEPTH};
    use crate::normalize::{normalize, NormalizeSpec, NormalizedRecord};
    use crate::report::{MemoryReporter, Severity};
    use crate::template::Template;

    fn port(flags: &[&str], description: Option<&str>) -> NormalizedRecord {
        let mut attributes = Record::default();
        for f in flags {
            attributes.fields.insert(f.to_string(), FieldValue::Flag(true));
        }
        if let Some(d) = description {
            attributes.fields.insert("description".into(), FieldValue::Text(d.into()));
        }
        NormalizedRecord {
            hostname: "sw1".into(),
            source: "configs/sw1.cfg".into(),
            entity: "Gi1/0/1".into(),
            attributes,
        }
    }

    fn judge(record: NormalizedRecord) -> Vec<Verdict> {
        evaluate(&rule(&default_phrases()), &[record], &MemoryReporter::default())
    }

    #[test]
    fn enabled_flag_passes_regardless_of_description() {
        for desc in [None, Some(""), Some("no exemption here"), Some("802.1X EXEMPT")] {
            for flag in ["dot1x_enabled", "dot1x_control"] {
                let v = judge(port(&["is_access_port", flag], desc));
                assert_eq!(v.len(), 1);
                assert!(v[0].compliant);
                assert_eq!(v[0].reason, Reason::ControlEnabled);
                assert!(v[0].control_enabled);
            }
        }
    }

    #[test]
    fn exempt_description_passes_case_insensitively() {
        for desc in ["802.1x exempt", "Printer 802.1X EXEMPTION", "Exempt: kiosk"] {
            let v = judge(port(&["is_access_port"], Some(desc)));
            assert_eq!(v.len(), 1);
            assert!(v[0].compliant, "{}", desc);
            assert_eq!(v[0].reason, Reason::Exemption);
            assert!(v[0].exempt);
            assert!(!v[0].control_enabled);
            assert_eq!(v[0].description, desc);
        }
    }

    #[test]
    fn no_control_no_exemption_fails_once() {
        for desc in [None, Some("User desk 4B-12")] {
            let v = judge(port(&["is_access_port"], desc));
            assert_eq!(v.len(), 1);
            assert!(!v[0].compliant);
            assert_eq!(v[0].reason, Reason::NoControl);
            assert_eq!(v[0].issue, "802.1X NonCompliant");
        }
    }

    #[test]
    fn out_of_scope_ports_have_no_verdict() {
        assert!(judge(port(&[], None)).is_empty());
        assert!(judge(port(&["is_trunk_port"], None)).is_empty());
    }

    #[test]
    fn access_and_trunk_is_ambiguous() {
        let v = judge(port(&["is_access_port", "is_trunk_port", "dot1x_enabled"], None));
        assert_eq!(v.len(), 1);
        assert!(!v[0].compliant);
        assert_eq!(v[0].reason, Reason::AmbiguousApplicability);
        assert!(v[0].issue.contains("trunk"));
    }

    #[test]
    fn flags_are_reported_independently_of_reason() {
        let v = judge(port(&["is_access_port", "dot1x_enabled"], Some("802.1x exempt")));
        assert_eq!(v[0].reason, Reason::ControlEnabled);
        assert!(v[0].control_enabled);
        assert!(v[0].exempt);

        let v = judge(port(&["is_access_port", "is_trunk_port", "dot1x_control"], None));
        assert_eq!(v[0].reason, Reason::AmbiguousApplicability);
        assert!(v[0].control_enabled);
        assert!(!v[0].exempt);
    }

    #[test]
    fn custom_phrases_replace_defaults() {
        let rule = rule(&["no-nac".to_string(), "  ".to_string()]);
        let r = MemoryReporter::default();
        let v = evaluate(&rule, &[port(&["is_access_port"], Some("Camera NO-NAC"))], &r);
        assert!(v[0].compliant);
        let v = evaluate(&rule, &[port(&["is_access_port"], Some("802.1x exempt"))], &r);
        assert!(!v[0].compliant);
    }

    #[test]
    fn three_port_scenario() {
        let input = std::fs::read_to_string("tests/fixtures/scenario-3port.cfg").unwrap();
        let t = Template::compile(TEMPLATE).unwrap();
        let result = Extractor::new(&t, DEFAULT_MAX_DEPTH).extract_str(&input).unwrap();
        let records = normalize(&result, "scenario", &NormalizeSpec::default());
        let reporter = MemoryReporter::default();
        let verdicts = evaluate(&rule(&default_phrases()), &records, &reporter);

        assert_eq!(verdicts.len(), 3);
        let failed: Vec<_> = verdicts.iter().filter(|v| !v.compliant).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].interface, "Gi1/0/1");
        assert_eq!(verdicts[1].reason, Reason::ControlEnabled);
        assert_eq!(verdicts[2].reason, Reason::Exemption);
        assert!(verdicts.iter().all(|v| v.hostname == "X"));
        assert_eq!(reporter.count(Severity::Warning), 1);
    }
}
