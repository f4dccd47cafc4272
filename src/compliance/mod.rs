pub mod dot1x;

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::normalize::NormalizedRecord;
use crate::report::{Reporter, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ControlEnabled,
    Exemption,
    NoControl,
    AmbiguousApplicability,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::ControlEnabled => "control_enabled",
            Reason::Exemption => "exemption",
            Reason::NoControl => "no_control",
            Reason::AmbiguousApplicability => "ambiguous_applicability",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Check = Box<dyn Fn(&NormalizedRecord) -> bool + Send + Sync>;

/// A named boolean test over one record.
pub struct Predicate {
    pub name: &'static str,
    check: Check,
}

impl Predicate {
    pub fn new(
        name: &'static str,
        check: impl Fn(&NormalizedRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Predicate {
            name,
            check: Box::new(check),
        }
    }

    pub fn holds(&self, record: &NormalizedRecord) -> bool {
        (self.check)(record)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
struct Exemption {
    predicate: Predicate,
    reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Short control name used in messages, e.g. "802.1X".
    pub label: String,
    pub description_field: String,
    applies: Predicate,
    conflicts: Vec<Predicate>,
    exemptions: Vec<Exemption>,
}

impl Rule {
    pub fn new(id: &str, name: &str, label: &str, applies: Predicate) -> Self {
        Rule {
            id: id.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            description_field: "description".to_string(),
            applies,
            conflicts: Vec::new(),
            exemptions: Vec::new(),
        }
    }

    /// A category that must not hold together with the applicability one.
    pub fn conflicting(mut self, predicate: Predicate) -> Self {
        self.conflicts.push(predicate);
        self
    }

    /// Append an exemption; earlier ones are checked first.
    pub fn exempt_when(mut self, predicate: Predicate, reason: Reason) -> Self {
        self.exemptions.push(Exemption { predicate, reason });
        self
    }

    pub fn reference(&self) -> RuleRef {
        RuleRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn applies_to(&self, record: &NormalizedRecord) -> bool {
        self.applies.holds(record)
    }

    /// Judge one in-scope record.
    pub fn judge(&self, record: &NormalizedRecord) -> Verdict {
        let conflicts: Vec<&str> = self
            .conflicts
            .iter()
            .filter(|p| p.holds(record))
            .map(|p| p.name)
            .collect();

        // Every exemption is checked so the verdict carries the raw flags;
        // only the first one that holds decides the reason.
        let held: Vec<Reason> = self
            .exemptions
            .iter()
            .filter(|e| e.predicate.holds(record))
            .map(|e| e.reason)
            .collect();

        let (compliant, reason, issue) = if !conflicts.is_empty() {
            let issue = format!(
                "{} NonCompliant: ambiguous applicability ({}, {})",
                self.label,
                self.applies.name,
                conflicts.iter().join(", ")
            );
            (false, Reason::AmbiguousApplicability, issue)
        } else {
            match held.first() {
                Some(&reason) => (true, reason, format!("{} Compliant", self.label)),
                None => (false, Reason::NoControl, format!("{} NonCompliant", self.label)),
            }
        };

        Verdict {
            hostname: record.hostname.clone(),
            interface: record.entity.clone(),
            source: record.source.clone(),
            compliant,
            reason,
            issue,
            description: record.text(&self.description_field).unwrap_or("").to_string(),
            control_enabled: held.contains(&Reason::ControlEnabled),
            exempt: held.contains(&Reason::Exemption),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub hostname: String,
    pub interface: String,
    pub source: String,
    pub compliant: bool,
    pub reason: Reason,
    pub issue: String,
    pub description: String,
    pub control_enabled: bool,
    pub exempt: bool,
}

/// One verdict per record the rule applies to, in record order.
pub fn evaluate(rule: &Rule, records: &[NormalizedRecord], reporter: &dyn Reporter) -> Vec<Verdict> {
    let in_scope: Vec<&NormalizedRecord> = records.iter().filter(|r| rule.applies_to(r)).collect();

    if let Some(first) = records.first() {
        reporter.record(
            Severity::Info,
            &format!(
                "Found {} in-scope ports ({}) on {}",
                in_scope.len(),
                rule.applies.name,
                first.hostname
            ),
        );
    }

    in_scope
        .into_iter()
        .map(|record| {
            let verdict = rule.judge(record);
            if verdict.compliant {
                reporter.record(
                    Severity::Info,
                    &format!("Compliant: {} - {}", verdict.interface, verdict.reason),
                );
            } else {
                reporter.record(
                    Severity::Warning,
                    &format!("Non-compliant: {} - {}", verdict.interface, verdict.issue),
                );
            }
            verdict
        })
        .collect()
}
