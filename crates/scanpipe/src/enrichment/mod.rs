//! Best-effort narrative reports generated from raw scan results.
//!
//! Every failure here surfaces as a [`PipelineError`] for the caller to log;
//! nothing in this module touches job status.

use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::{
    config::EnrichmentConfig,
    error::PipelineError,
    models::EnhancedReport,
    parser::extract_json_object,
};

const SYSTEM_PROMPT: &str = "You are a senior penetration tester writing reports for engineering \
     and management audiences. Reply with a single JSON object and nothing else.";

const PROMPT_TEMPLATE: &str = r#"Analyze the following raw security scan results and produce a report.

Return a JSON object with exactly these top-level fields:
- "executive_summary": string, 2-4 sentences for a non-technical reader
- "risk_assessment": {"overall_risk": "critical" | "high" | "medium" | "low", "risk_factors": [string]}
- "vulnerabilities": [{"id": string, "title": string, "severity": string, "description": string,
  "impact": string, "remediation": string, "references": [string]}], most severe first
- "recommendations": [{"title": string, "priority": string, "description": string, "implementation": string}]

Scan results:
{scan_results}"#;

/// Top-level fields the reply must carry, with the camelCase spelling we also accept.
const REQUIRED_FIELDS: [(&str, &str); 4] = [
    ("executive_summary", "executiveSummary"),
    ("risk_assessment", "riskAssessment"),
    ("vulnerabilities", "vulnerabilities"),
    ("recommendations", "recommendations"),
];

#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, PipelineError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    pub fn new(cfg: &EnrichmentConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder().timeout(cfg.timeout()).build()?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }
}

#[async_trait::async_trait]
impl TextGenerator for ChatCompletionsClient {
    async fn generate(&self, prompt: &str) -> Result<String, PipelineError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::EnrichmentTransport(format!(
                "LLM API error ({status}): {text}"
            )));
        }

        let payload: Value = resp.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::EnrichmentTransport("response has no message content".to_string())
            })
    }
}

pub struct EnrichmentAdapter {
    generator: Arc<dyn TextGenerator>,
    cache: Cache<String, EnhancedReport>,
}

impl EnrichmentAdapter {
    pub fn new(generator: Arc<dyn TextGenerator>, capacity: u64, ttl: Duration) -> Self {
        Self {
            generator,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn from_config(cfg: &EnrichmentConfig) -> Result<Self, PipelineError> {
        let client = ChatCompletionsClient::new(cfg)?;
        Ok(Self::new(
            Arc::new(client),
            cfg.cache_capacity,
            Duration::from_secs(cfg.cache_ttl_secs),
        ))
    }

    /// Builds a report for `raw`, reusing a cached one for byte-identical input.
    pub async fn enrich(&self, raw: &Value) -> Result<EnhancedReport, PipelineError> {
        let key = raw.to_string();
        if let Some(report) = self.cache.get(&key) {
            debug!("enrichment cache hit");
            return Ok(report);
        }

        let reply = self.generator.generate(&build_prompt(&key)).await?;
        let report = parse_enhanced_report(&reply)?;
        info!(
            vulnerabilities = report.vulnerabilities.len(),
            recommendations = report.recommendations.len(),
            "enrichment report generated"
        );
        self.cache.insert(key, report.clone());
        Ok(report)
    }
}

pub fn build_prompt(scan_json: &str) -> String {
    PROMPT_TEMPLATE.replace("{scan_results}", scan_json)
}

/// Pulls the report object out of free-form model output and checks its shape.
pub fn parse_enhanced_report(text: &str) -> Result<EnhancedReport, PipelineError> {
    let map = extract_json_object(text)
        .map_err(|e| PipelineError::InvalidEnrichmentShape(e.to_string()))?;

    let missing = missing_fields(&map);
    if !missing.is_empty() {
        return Err(PipelineError::InvalidEnrichmentShape(format!(
            "missing fields: {}",
            missing.join(", ")
        )));
    }

    serde_json::from_value(Value::Object(map))
        .map_err(|e| PipelineError::InvalidEnrichmentShape(e.to_string()))
}

fn missing_fields(map: &Map<String, Value>) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .filter(|(snake, camel)| !map.contains_key(*snake) && !map.contains_key(*camel))
        .map(|(snake, _)| *snake)
        .collect()
}
