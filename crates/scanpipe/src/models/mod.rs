use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum ScanStatus {
    InProgress,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

impl SeverityCounts {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.critical + self.high + self.medium + self.low
    }
}

/// Persisted report for one scan invocation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanJob {
    pub id: String,
    pub target: String,
    pub modules: Json<Vec<String>>,
    pub status: ScanStatus,
    pub critical_count: i64,
    pub high_count: i64,
    pub medium_count: i64,
    pub low_count: i64,
    /// Worker payload on success, diagnostic payload on error.
    pub raw_output: Option<Json<Value>>,
    pub enhanced_report: Option<Json<EnhancedReport>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanJob {
    pub fn counts(&self) -> SeverityCounts {
        SeverityCounts {
            critical: self.critical_count,
            high: self.high_count,
            medium: self.medium_count,
            low: self.low_count,
        }
    }
}

/// One vulnerability row, owned by exactly one scan job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Finding {
    pub id: String,
    pub scan_id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub module: String,
    pub category: String,
    pub finding_type: String,
    pub details: Option<Json<Value>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFinding {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub module: String,
    pub category: String,
    pub finding_type: String,
    pub details: Option<Value>,
}

/// A single entry pulled out of the worker's `module -> category -> [finding]` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFinding {
    pub module: String,
    pub category: String,
    pub finding_type: String,
    pub description: String,
    pub details: Option<Value>,
}

/// Worker payload after extraction: the raw object plus its flattened findings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub raw: Value,
    pub findings: Vec<ExtractedFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedReport {
    #[serde(alias = "executiveSummary")]
    pub executive_summary: String,
    #[serde(alias = "riskAssessment")]
    pub risk_assessment: RiskAssessment,
    pub vulnerabilities: Vec<EnrichedVulnerability>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    #[serde(alias = "overallRisk")]
    pub overall_risk: String,
    #[serde(default, alias = "riskFactors")]
    pub risk_factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedVulnerability {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub severity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub remediation: String,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub priority: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub implementation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressState {
    Idle,
    InProgress,
    Completed,
    Error,
}

impl From<ScanStatus> for ProgressState {
    fn from(status: ScanStatus) -> Self {
        match status {
            ScanStatus::InProgress => ProgressState::InProgress,
            ScanStatus::Completed => ProgressState::Completed,
            ScanStatus::Error => ProgressState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub status: ProgressState,
    pub progress: u8,
    pub findings_count: i64,
}
