use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    adapters::WorkerOutput,
    error::PipelineError,
    models::{ExtractedFinding, NewFinding, ScanJob, ScanResult, ScanStatus, SeverityCounts},
    severity::SeverityTable,
    store::ReportStore,
};

/// Result of moving a job to `completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub counts: SeverityCounts,
    pub persisted: usize,
    pub failed: usize,
    /// False when the job was already terminal and nothing changed.
    pub transitioned: bool,
}

impl Finalized {
    fn untouched() -> Self {
        Self {
            counts: SeverityCounts::default(),
            persisted: 0,
            failed: 0,
            transitioned: false,
        }
    }
}

/// Owns the `in-progress -> completed | error` transitions of scan jobs.
#[derive(Clone)]
pub struct ReportLifecycle {
    store: Arc<dyn ReportStore>,
    severity: SeverityTable,
}

impl ReportLifecycle {
    pub fn new(store: Arc<dyn ReportStore>, severity: SeverityTable) -> Self {
        Self { store, severity }
    }

    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    pub async fn create(&self, target: &str, modules: &[String]) -> Result<ScanJob, PipelineError> {
        let job = self.store.create_job(target, modules).await?;
        info!(scan_id = %job.id, target = %target, "scan job created");
        Ok(job)
    }

    /// Persists every finding, then marks the job `completed` with the counts.
    ///
    /// A finding that fails to persist is logged and skipped; it still counts
    /// toward the severity totals. A job that is missing or already terminal
    /// gets no findings and is left untouched.
    pub async fn finalize(&self, job_id: &str, result: &ScanResult) -> Result<Finalized, PipelineError> {
        match self.store.get_job(job_id).await? {
            Some(job) if job.status == ScanStatus::InProgress => {}
            Some(job) => {
                warn!(scan_id = job_id, status = ?job.status, "finalize on a job that is already terminal");
                return Ok(Finalized::untouched());
            }
            None => {
                warn!(scan_id = job_id, "finalize on an unknown job");
                return Ok(Finalized::untouched());
            }
        }

        let mut counts = SeverityCounts::default();
        let mut persisted = 0;
        let mut failed = 0;

        for found in &result.findings {
            let finding = self.classify(found);
            counts.record(finding.severity);

            match self.store.insert_finding(job_id, &finding).await {
                Ok(_) => persisted += 1,
                Err(source) => {
                    failed += 1;
                    let err = PipelineError::FindingPersist {
                        module: finding.module.clone(),
                        finding_type: finding.finding_type.clone(),
                        source,
                    };
                    warn!(scan_id = job_id, error = %err, "finding not persisted");
                }
            }
        }

        let transitioned = self.store.complete_job(job_id, counts, &result.raw).await?;
        if transitioned {
            info!(
                scan_id = job_id,
                critical = counts.critical,
                high = counts.high,
                medium = counts.medium,
                low = counts.low,
                persisted,
                failed,
                "scan completed"
            );
        } else {
            warn!(scan_id = job_id, "job left in-progress before completion was recorded");
        }

        Ok(Finalized {
            counts,
            persisted,
            failed,
            transitioned,
        })
    }

    /// Moves the job to `error` with a diagnostic payload. No-op on terminal jobs.
    pub async fn fail(
        &self,
        job_id: &str,
        cause: &PipelineError,
        output: Option<&WorkerOutput>,
    ) -> Result<bool, PipelineError> {
        let diagnostic = diagnostic_payload(cause, output);
        let transitioned = self.store.fail_job(job_id, &diagnostic).await?;
        if transitioned {
            warn!(scan_id = job_id, kind = cause.kind(), error = %cause, "scan failed");
        }
        Ok(transitioned)
    }

    fn classify(&self, found: &ExtractedFinding) -> NewFinding {
        NewFinding {
            title: humanize(&found.finding_type),
            description: found.description.clone(),
            severity: self.severity.classify(&found.module, &found.finding_type),
            module: found.module.clone(),
            category: found.category.clone(),
            finding_type: found.finding_type.clone(),
            details: found.details.clone(),
        }
    }
}

fn diagnostic_payload(cause: &PipelineError, output: Option<&WorkerOutput>) -> Value {
    let mut payload = json!({
        "error": {
            "kind": cause.kind(),
            "message": cause.to_string(),
        }
    });
    if let Some(out) = output {
        payload["exit_code"] = json!(out.exit_code);
        payload["timed_out"] = json!(out.timed_out);
        payload["stdout"] = json!(out.stdout);
        payload["stderr"] = json!(out.stderr);
    }
    payload
}

/// `header_leak` -> `Header Leak`
fn humanize(tag: &str) -> String {
    tag.split(|c: char| c == '_' || c == '-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
