// src/publish/hec.rs

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use url::Url;

use super::{
    event::{fields_from_json, Event, FieldValue, Fields},
    offset::format_timestamp,
    sink::{Sink, SinkError},
};
use crate::config::HecConfig;

/// Path appended to a collector URL given without one.
pub const EVENT_PATH: &str = "/services/collector/event";
/// Sourcetype of the connectivity probe event.
pub const PROBE_SOURCETYPE: &str = "splitpub:test";

const MAX_ERROR_BODY: usize = 512;

/// `{"text": "Success", "code": 0}`
#[derive(Debug, Deserialize)]
struct HecResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    code: i64,
}

/// HTTP Event Collector client.
#[derive(Debug, Clone)]
pub struct HecClient {
    client: Client,
    endpoint: Url,
    token: String,
    headers: HeaderMap,
    index: String,
    host: String,
    source: String,
}

impl HecClient {
    pub fn new(config: &HecConfig) -> Result<Self> {
        let endpoint = endpoint_url(&config.url)?;
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .gzip(true)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
            headers: parse_headers(&config.headers)?,
            index: config.index.clone(),
            host: config.host.clone(),
            source: config.source.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn send_event(&self, event: &Event) -> Result<(), SinkError> {
        self.send_batch(std::slice::from_ref(event)).await
    }

    /// Newline-delimited JSON with the client's defaults filled in.
    fn encode(&self, events: &[Event]) -> Result<Vec<u8>, SinkError> {
        let mut body = Vec::with_capacity(events.len() * 256);
        for event in events {
            let mut event = event.clone();
            if event.index.is_empty() {
                event.index = self.index.clone();
            }
            if event.host.is_empty() {
                event.host = self.host.clone();
            }
            if event.source.is_empty() {
                event.source = self.source.clone();
            }
            serde_json::to_writer(&mut body, &event)?;
            body.push(b'\n');
        }
        Ok(body)
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Splunk {}", self.token))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        debug!(status = %status, body = %truncate(&text), "collector response");

        match serde_json::from_str::<HecResponse>(&text) {
            Ok(reply) if reply.code != 0 => Err(SinkError::Collector {
                code: reply.code,
                text: reply.text,
            }),
            _ if !status.is_success() => Err(SinkError::Status {
                status: status.as_u16(),
                body: truncate(&text).to_string(),
            }),
            Ok(_) => Ok(()),
            Err(err) => Err(SinkError::Decode(err.to_string())),
        }
    }
}

#[async_trait]
impl Sink for HecClient {
    #[instrument(level = "debug", skip_all, fields(events = events.len()))]
    async fn send_batch(&self, events: &[Event]) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        let body = self.encode(events)?;
        debug!(bytes = body.len(), url = %self.endpoint, "posting batch");
        self.post(body).await
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        let mut fields = Fields::new();
        fields.insert(
            "message".into(),
            FieldValue::from("collector connection test from splitpub"),
        );
        let probe = Event {
            sourcetype: PROBE_SOURCETYPE.to_string(),
            ..Event::with_fields(fields)
        };
        self.send_event(&probe).await
    }
}

/// Outcome of one `hec-test` stage.
#[derive(Debug)]
pub struct StageOutcome {
    pub stage: &'static str,
    pub result: Result<(), SinkError>,
}

/// Staged collector checks: connectivity, timestamps, a batch of `batch_size`
/// events and a nested payload. Later stages are skipped when the collector
/// cannot be reached at all.
pub async fn diagnose(client: &HecClient, sourcetype: &str, batch_size: usize) -> Vec<StageOutcome> {
    let now = Utc::now();
    let make = |test: &str, message: String, time: Option<i64>| {
        let mut fields = Fields::new();
        fields.insert("message".into(), FieldValue::from(message));
        fields.insert("test".into(), FieldValue::from(test));
        Event {
            time,
            sourcetype: sourcetype.to_string(),
            ..Event::with_fields(fields)
        }
    };

    let mut outcomes = Vec::with_capacity(4);

    // ─── 1) basic connectivity ──────────────────────────────────────
    let basic = make("basic_connectivity", "collector connection test from splitpub".into(), None);
    let result = client.send_event(&basic).await;
    let reachable = result.is_ok();
    outcomes.push(StageOutcome {
        stage: "basic connectivity",
        result,
    });
    if !reachable {
        return outcomes;
    }

    // ─── 2) explicit timestamp ──────────────────────────────────────
    let stamped = make(
        "timestamp_test",
        "collector timestamp test from splitpub".into(),
        Some(now.timestamp()),
    );
    outcomes.push(StageOutcome {
        stage: "timestamped event",
        result: client.send_event(&stamped).await,
    });

    // ─── 3) batch ───────────────────────────────────────────────────
    let batch: Vec<Event> = (0..batch_size.max(1))
        .map(|i| {
            let mut event = make(
                "batch_test",
                format!("collector batch test event {} from splitpub", i + 1),
                Some(now.timestamp() + i as i64),
            );
            event.fields.insert("counter".into(), FieldValue::from(i as i64));
            event
        })
        .collect();
    outcomes.push(StageOutcome {
        stage: "batch",
        result: client.send_batch(&batch).await,
    });

    // ─── 4) nested structure ────────────────────────────────────────
    let mut nested = make("complex_structure_test", "collector complex event test from splitpub".into(), None);
    let extra = json!({
        "timestamp": format_timestamp(now),
        "numeric": 123.456,
        "boolean": true,
        "nested_data": {"field1": "value1", "field2": 42, "field3": false},
        "array_data": ["item1", "item2", "item3"]
    });
    if let serde_json::Value::Object(map) = extra {
        nested.fields.extend(fields_from_json(map));
    }
    outcomes.push(StageOutcome {
        stage: "nested structure",
        result: client.send_event(&nested).await,
    });

    outcomes
}

/// Parse the collector URL; a bare host gets the event endpoint path.
pub fn endpoint_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid collector URL `{}`", raw))?;
    if url.cannot_be_a_base() {
        return Err(anyhow!("invalid collector URL `{}`", raw));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(EVENT_PATH);
    }
    Ok(url)
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::try_from(key.as_str())
            .map_err(|e| anyhow!("invalid header name '{}': {}", key, e))?;
        let val = HeaderValue::from_str(value)
            .map_err(|e| anyhow!("invalid header value for '{}': {}", key, e))?;
        map.insert(name, val);
    }
    Ok(map)
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
