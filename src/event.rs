use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::compliance::{Reason, RuleRef, Verdict};

pub const CATEGORIES: &[&str] = &["configuration"];
pub const TYPES: &[&str] = &["compliance"];
pub const TAGS: &[&str] = &["dot1x", "network", "compliance"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alert,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub kind: EventKind,
    pub category: Vec<String>,
    #[serde(rename = "type")]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMeta {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dot1x {
    pub enabled: bool,
    pub exempt: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compliance {
    pub status: Status,
    pub reason: Reason,
}

/// One verdict in Elastic Common Schema layout: `@timestamp`, `host.name`,
/// `network.interface`, `event.*`, `rule.*`, `compliance.status`, plus a
/// `dot1x` object with the raw attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub report_date: String,
    pub host: Host,
    pub network: Network,
    pub event: EventMeta,
    pub rule: RuleMeta,
    pub message: String,
    pub dot1x: Dot1x,
    pub compliance: Compliance,
    pub source: String,
    pub tags: Vec<String>,
}

impl IndexedEvent {
    /// Stable identity for backend-side deduplication: resubmitting the same
    /// event overwrites rather than duplicates. The source document is part of
    /// it because hostnames repeat (and every nameless device is `UNKNOWN`).
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.host.name, self.source, self.network.interface, self.timestamp
        )
    }

    pub fn passed(&self) -> bool {
        self.compliance.status == Status::Passed
    }
}

/// Stamps every event of one batch with the same generation time.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    timestamp: String,
    report_date: String,
    rule: RuleRef,
}

impl EventTransformer {
    pub fn new(generated_at: DateTime<Utc>, rule: RuleRef) -> Self {
        EventTransformer {
            timestamp: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            report_date: generated_at.format("%Y-%m-%d").to_string(),
            rule,
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn transform(&self, verdict: &Verdict) -> IndexedEvent {
        let (kind, status) = if verdict.compliant {
            (EventKind::Event, Status::Passed)
        } else {
            (EventKind::Alert, Status::Failed)
        };

        IndexedEvent {
            timestamp: self.timestamp.clone(),
            report_date: self.report_date.clone(),
            host: Host {
                name: verdict.hostname.clone(),
            },
            network: Network {
                interface: verdict.interface.clone(),
            },
            event: EventMeta {
                kind,
                category: to_strings(CATEGORIES),
                types: to_strings(TYPES),
            },
            rule: RuleMeta {
                id: self.rule.id.clone(),
                name: self.rule.name.clone(),
            },
            message: verdict.issue.clone(),
            dot1x: Dot1x {
                enabled: verdict.control_enabled,
                exempt: verdict.exempt,
                description: verdict.description.clone(),
            },
            compliance: Compliance {
                status,
                reason: verdict.reason,
            },
            source: verdict.source.clone(),
            tags: to_strings(TAGS),
        }
    }

    pub fn transform_all(&self, verdicts: &[Verdict]) -> Vec<IndexedEvent> {
        verdicts.iter().map(|v| self.transform(v)).collect()
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ── Tests ──
