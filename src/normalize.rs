use serde::Serialize;

use crate::extract::{ExtractionResult, Record};

pub const UNKNOWN_HOST: &str = "UNKNOWN";
pub const UNKNOWN_ENTITY: &str = "Unknown";

/// Which groups and fields the normalizer reads.
#[derive(Debug, Clone)]
pub struct NormalizeSpec {
    pub metadata_group: String,
    pub host_field: String,
    pub entity_group: String,
    pub entity_field: String,
}

impl Default for NormalizeSpec {
    fn default() -> Self {
        NormalizeSpec {
            metadata_group: "metadata".into(),
            host_field: "hostname".into(),
            entity_group: "interfaces".into(),
            entity_field: "interface_name".into(),
        }
    }
}

/// One entity with its device metadata merged in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub hostname: String,
    pub source: String,
    pub entity: String,
    pub attributes: Record,
}

impl NormalizedRecord {
    pub fn flag(&self, field: &str) -> bool {
        self.attributes.flag(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.attributes.text(field)
    }
}

/// Flatten one extraction result into per-entity records, in input order.
/// A missing hostname becomes `UNKNOWN` rather than an error.
pub fn normalize(
    result: &ExtractionResult,
    source: &str,
    spec: &NormalizeSpec,
) -> Vec<NormalizedRecord> {
    let hostname = hostname(result, spec);

    result
        .group(&spec.entity_group)
        .iter()
        .map(|entity| NormalizedRecord {
            hostname: hostname.clone(),
            source: source.to_string(),
            entity: entity
                .get(&spec.entity_field)
                .map(|v| v.to_string())
                .unwrap_or_else(|| UNKNOWN_ENTITY.to_string()),
            attributes: entity.clone(),
        })
        .collect()
}

pub fn hostname(result: &ExtractionResult, spec: &NormalizeSpec) -> String {
    result
        .first(&spec.metadata_group)
        .and_then(|md| md.get(&spec.host_field))
        .map(|v| v.to_string())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Extractor, DEFAULT_MAX_DEPTH};
    use crate::template::Template;

    const DOT1X: &str = include_str!("../templates/dot1x.ttp");

    fn records(input: &str) -> Vec<NormalizedRecord> {
        let t = Template::compile(DOT1X).unwrap();
        let r = Extractor::new(&t, DEFAULT_MAX_DEPTH).extract_str(input).unwrap();
        normalize(&r, "configs/test.cfg", &NormalizeSpec::default())
    }

    #[test]
    fn merges_hostname_and_source() {
        let recs = records("hostname core1\ninterface Gi1\n switchport mode access\ninterface Gi2\n");
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.hostname == "core1" && r.source == "configs/test.cfg"));
        assert_eq!(recs[0].entity, "Gi1");
        assert!(recs[0].flag("is_access_port"));
        assert_eq!(recs[1].entity, "Gi2");
    }

    #[test]
    fn missing_metadata_uses_sentinel() {
        let recs = records("interface Gi1\n");
        assert_eq!(recs[0].hostname, UNKNOWN_HOST);
    }

    #[test]
    fn no_entities_no_records() {
        assert!(records("hostname lonely\n").is_empty());
        assert!(records("").is_empty());
    }

    #[test]
    fn first_metadata_instance_wins() {
        let recs = records("hostname a\nhostname b\ninterface Gi1\n");
        assert_eq!(recs[0].hostname, "a");
    }

    #[test]
    fn custom_groups() {
        let t = Template::compile("<group name=\"dev\">\nsysname {{ name }}\n</group>\n<group name=\"ports\">\nport {{ id }}\n</group>").unwrap();
        let r = Extractor::new(&t, DEFAULT_MAX_DEPTH)
            .extract_str("sysname edge7\nport 1\nport 2\n")
            .unwrap();
        let spec = NormalizeSpec {
            metadata_group: "dev".into(),
            host_field: "name".into(),
            entity_group: "ports".into(),
            entity_field: "id".into(),
        };
        let recs = normalize(&r, "x", &spec);
        let ids: Vec<_> = recs.iter().map(|r| (r.hostname.as_str(), r.entity.as_str())).collect();
        assert_eq!(ids, vec![("edge7", "1"), ("edge7", "2")]);
    }
}
