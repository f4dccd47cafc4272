use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{BulkBackend, IndexError, ItemOutcome};
use crate::event::IndexedEvent;

const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug)]
pub struct ElasticBackend {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl ElasticBackend {
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

impl BulkBackend for ElasticBackend {
    async fn bulk(&self, index: &str, events: &[IndexedEvent]) -> Result<Vec<ItemOutcome>, IndexError> {
        let body = bulk_body(index, events)?;
        debug!("POST {}/_bulk with {} events", self.base_url, events.len());

        let mut request = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        if let Some(c) = &self.credentials {
            request = request.basic_auth(&c.user, Some(&c.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(IndexError::Http {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        parse_bulk_response(&text)
    }
}

/// Action line plus document line per event. The `_id` makes resubmission
/// overwrite instead of duplicate.
pub fn bulk_body(index: &str, events: &[IndexedEvent]) -> Result<String, IndexError> {
    let mut body = String::new();
    for event in events {
        let action = json!({ "index": { "_index": index, "_id": event.id() } });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&serde_json::to_string(event)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Deserialize)]
struct BulkResponse {
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub fn parse_bulk_response(body: &str) -> Result<Vec<ItemOutcome>, IndexError> {
    let response: BulkResponse =
        serde_json::from_str(body).map_err(|e| IndexError::Response(e.to_string()))?;

    response
        .items
        .into_iter()
        .map(|item| {
            let (_, item) = item
                .into_iter()
                .next()
                .ok_or_else(|| IndexError::Response("empty bulk item".into()))?;
            if (200..300).contains(&item.status) {
                Ok(ItemOutcome::Accepted)
            } else {
                Ok(ItemOutcome::Rejected(describe(&item)))
            }
        })
        .collect()
}

fn describe(item: &BulkItem) -> String {
    let error = item.error.as_ref();
    let kind = error.and_then(|e| e.get("type")).and_then(|v| v.as_str());
    let reason = error.and_then(|e| e.get("reason")).and_then(|v| v.as_str());
    match (kind, reason) {
        (Some(k), Some(r)) => format!("{}: {}", k, r),
        (Some(k), None) => k.to_string(),
        (None, Some(r)) => r.to_string(),
        (None, None) => format!("HTTP {}", item.status),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::sample_events;

    #[test]
    fn body_pairs_action_and_document() {
        let events = sample_events(2);
        let body = bulk_body("dot1x-compliance", &events).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));

        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "dot1x-compliance");
        assert_eq!(action["index"]["_id"], events[0].id());

        let doc: IndexedEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc, events[0]);
    }

    #[test]
    fn empty_batch_empty_body() {
        assert_eq!(bulk_body("x", &[]).unwrap(), "");
    }

    #[test]
    fn mixed_item_statuses() {
        let body = r#"{
            "took": 3, "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "failed to parse field"}}},
                {"index": {"_id": "c", "status": 200}},
                {"create": {"_id": "d", "status": 429}}
            ]
        }"#;
        let outcomes = parse_bulk_response(body).unwrap();
        assert_eq!(
            outcomes,
            vec![
                ItemOutcome::Accepted,
                ItemOutcome::Rejected("mapper_parsing_exception: failed to parse field".into()),
                ItemOutcome::Accepted,
                ItemOutcome::Rejected("HTTP 429".into()),
            ]
        );
    }

    #[test]
    fn garbage_response_is_an_error() {
        assert!(matches!(
            parse_bulk_response("<html>proxy error</html>"),
            Err(IndexError::Response(_))
        ));
        assert!(matches!(
            parse_bulk_response(r#"{"items": [{}]}"#),
            Err(IndexError::Response(_))
        ));
    }
}
