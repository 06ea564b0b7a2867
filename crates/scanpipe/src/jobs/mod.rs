mod lifecycle;
mod progress;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

pub use lifecycle::{Finalized, ReportLifecycle};
pub use progress::progress;

use crate::{
    adapters::{ScanRequest, ScanWorker, WorkerOutput},
    enrichment::EnrichmentAdapter,
    error::PipelineError,
    models::SeverityCounts,
    parser::parse_scan_output,
};

#[derive(Debug, Clone)]
pub struct QueuedScan {
    pub id: String,
    pub target: String,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed {
        counts: SeverityCounts,
        findings: usize,
        raw: Value,
    },
    Failed {
        kind: &'static str,
    },
}

#[derive(Debug)]
pub struct RateLimiter {
    limit_per_minute: usize,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: usize) -> Self {
        Self {
            limit_per_minute,
            requests: VecDeque::new(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= Duration::from_secs(60) {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.requests.len() >= self.limit_per_minute {
            return false;
        }
        self.requests.push_back(now);
        true
    }
}

/// Drives one job from worker launch to a terminal state, then enrichment.
pub struct ScanPipeline {
    worker: Arc<dyn ScanWorker>,
    lifecycle: ReportLifecycle,
    enrichment: Option<Arc<EnrichmentAdapter>>,
}

impl ScanPipeline {
    pub fn new(
        worker: Arc<dyn ScanWorker>,
        lifecycle: ReportLifecycle,
        enrichment: Option<Arc<EnrichmentAdapter>>,
    ) -> Self {
        Self {
            worker,
            lifecycle,
            enrichment,
        }
    }

    pub fn lifecycle(&self) -> &ReportLifecycle {
        &self.lifecycle
    }

    /// Runs the worker and lands the job in exactly one terminal state.
    pub async fn run(&self, job: &QueuedScan) -> PipelineOutcome {
        let store = self.lifecycle.store();
        if let Err(e) = store
            .record_audit(
                "launch_worker",
                "system",
                &format!("scan_id={} worker={} target={}", job.id, self.worker.name(), job.target),
            )
            .await
        {
            warn!(error = %e, scan_id = %job.id, "audit log write failed");
        }

        let output = match self
            .worker
            .run(ScanRequest {
                target: job.target.clone(),
                modules: job.modules.clone(),
            })
            .await
        {
            Ok(output) => output,
            Err(e) => return self.fail(&job.id, e, None).await,
        };

        if output.timed_out {
            let cause = PipelineError::Timeout {
                after_secs: self.worker.timeout().as_secs(),
            };
            return self.fail(&job.id, cause, Some(&output)).await;
        }
        if !output.success() {
            let cause = PipelineError::WorkerExit {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            };
            return self.fail(&job.id, cause, Some(&output)).await;
        }

        let result = match parse_scan_output(&output.stdout) {
            Ok(result) => result,
            Err(e) => return self.fail(&job.id, e, Some(&output)).await,
        };

        match self.lifecycle.finalize(&job.id, &result).await {
            Ok(Finalized { counts, persisted, .. }) => PipelineOutcome::Completed {
                counts,
                findings: persisted,
                raw: result.raw,
            },
            Err(e) => {
                // Job is still in-progress if completion itself failed to persist.
                self.fail(&job.id, e, Some(&output)).await
            }
        }
    }

    /// Attaches an enhanced report to a completed job. Failures are logged only.
    pub async fn enrich(&self, job_id: &str, raw: &Value) {
        let Some(adapter) = &self.enrichment else {
            return;
        };
        let report = match adapter.enrich(raw).await {
            Ok(report) => report,
            Err(e) => {
                warn!(scan_id = job_id, kind = e.kind(), error = %e, "enrichment skipped");
                return;
            }
        };
        match self.lifecycle.store().attach_enhanced_report(job_id, &report).await {
            Ok(true) => info!(scan_id = job_id, "enhanced report attached"),
            Ok(false) => warn!(scan_id = job_id, "enhanced report not attached; job not completed"),
            Err(e) => warn!(scan_id = job_id, error = %e, "failed to store enhanced report"),
        }
    }

    async fn fail(
        &self,
        job_id: &str,
        cause: PipelineError,
        output: Option<&WorkerOutput>,
    ) -> PipelineOutcome {
        if let Err(e) = self.lifecycle.fail(job_id, &cause, output).await {
            error!(scan_id = job_id, error = %e, cause = %cause, "could not record scan failure");
        }
        PipelineOutcome::Failed { kind: cause.kind() }
    }
}

/// Receives queued scans and runs each on its own task, at most
/// `max_concurrent` worker processes at a time.
pub async fn worker_loop(
    pipeline: Arc<ScanPipeline>,
    mut rx: mpsc::Receiver<QueuedScan>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let outcome = pipeline.run(&job).await;
            drop(permit);
            if let PipelineOutcome::Completed { raw, .. } = outcome {
                pipeline.enrich(&job.id, &raw).await;
            }
        });
    }
    info!("scan queue closed; dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::{json, Value};

    use super::*;
    use crate::{
        db::memory_pool,
        enrichment::TextGenerator,
        models::{EnhancedReport, Finding, NewFinding, ScanJob, ScanStatus, Severity},
        severity::SeverityTable,
        store::{ReportStore, SqliteReportStore},
    };

    const RECON_STDOUT: &str = "[*] resolving api.example.com\n[*] running recon\n\
        {\"recon\":{\"info_disclosure\":[{\"type\":\"header_leak\",\"description\":\"Server header exposes version\"}]}}\n";

    enum Scripted {
        Output(WorkerOutput),
        LaunchFails,
    }

    struct FakeWorker(Scripted);

    #[async_trait::async_trait]
    impl ScanWorker for FakeWorker {
        fn name(&self) -> &str {
            "fake"
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn run(&self, _req: ScanRequest) -> Result<WorkerOutput, PipelineError> {
            match &self.0 {
                Scripted::Output(out) => Ok(out.clone()),
                Scripted::LaunchFails => Err(PipelineError::ProcessLaunch {
                    program: "scan-worker".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }

    fn exited(code: i32, stdout: &str, stderr: &str) -> Scripted {
        Scripted::Output(WorkerOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            timed_out: false,
        })
    }

    /// Delegates to SQLite but refuses findings tagged `poison`.
    struct FlakyStore(SqliteReportStore);

    #[async_trait::async_trait]
    impl ReportStore for FlakyStore {
        async fn create_job(&self, target: &str, modules: &[String]) -> Result<ScanJob, sqlx::Error> {
            self.0.create_job(target, modules).await
        }
        async fn get_job(&self, id: &str) -> Result<Option<ScanJob>, sqlx::Error> {
            self.0.get_job(id).await
        }
        async fn list_jobs(&self, limit: i64) -> Result<Vec<ScanJob>, sqlx::Error> {
            self.0.list_jobs(limit).await
        }
        async fn insert_finding(&self, scan_id: &str, finding: &NewFinding) -> Result<String, sqlx::Error> {
            if finding.finding_type == "poison" {
                return Err(sqlx::Error::Protocol("injected failure".to_string()));
            }
            self.0.insert_finding(scan_id, finding).await
        }
        async fn list_findings(&self, scan_id: &str) -> Result<Vec<Finding>, sqlx::Error> {
            self.0.list_findings(scan_id).await
        }
        async fn count_findings(&self, scan_id: &str) -> Result<i64, sqlx::Error> {
            self.0.count_findings(scan_id).await
        }
        async fn complete_job(
            &self,
            id: &str,
            counts: SeverityCounts,
            raw_output: &Value,
        ) -> Result<bool, sqlx::Error> {
            self.0.complete_job(id, counts, raw_output).await
        }
        async fn fail_job(&self, id: &str, diagnostic: &Value) -> Result<bool, sqlx::Error> {
            self.0.fail_job(id, diagnostic).await
        }
        async fn attach_enhanced_report(
            &self,
            id: &str,
            report: &EnhancedReport,
        ) -> Result<bool, sqlx::Error> {
            self.0.attach_enhanced_report(id, report).await
        }
        async fn record_audit(&self, action: &str, actor: &str, details: &str) -> Result<(), sqlx::Error> {
            self.0.record_audit(action, actor, details).await
        }
    }

    struct Generator(Result<String, String>);

    #[async_trait::async_trait]
    impl TextGenerator for Generator {
        async fn generate(&self, _prompt: &str) -> Result<String, PipelineError> {
            self.0.clone().map_err(PipelineError::EnrichmentTransport)
        }
    }

    async fn sqlite_store() -> Arc<dyn ReportStore> {
        Arc::new(SqliteReportStore::new(memory_pool().await))
    }

    fn pipeline(
        store: Arc<dyn ReportStore>,
        worker: Scripted,
        generator: Option<Generator>,
    ) -> ScanPipeline {
        let enrichment = generator.map(|g| {
            Arc::new(EnrichmentAdapter::new(Arc::new(g), 16, Duration::from_secs(60)))
        });
        ScanPipeline::new(
            Arc::new(FakeWorker(worker)),
            ReportLifecycle::new(store, SeverityTable::builtin()),
            enrichment,
        )
    }

    async fn queue(p: &ScanPipeline, target: &str, modules: &[&str]) -> QueuedScan {
        let modules: Vec<String> = modules.iter().map(|m| m.to_string()).collect();
        let job = p.lifecycle().create(target, &modules).await.unwrap();
        QueuedScan {
            id: job.id,
            target: target.to_string(),
            modules,
        }
    }

    async fn reload(p: &ScanPipeline, id: &str) -> ScanJob {
        p.lifecycle().store().get_job(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn recon_header_leak_completes_with_one_low_finding() {
        let p = pipeline(sqlite_store().await, exited(0, RECON_STDOUT, ""), None);
        let job = queue(&p, "api.example.com", &["recon"]).await;

        let outcome = p.run(&job).await;
        assert!(matches!(outcome, PipelineOutcome::Completed { findings: 1, .. }));

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Completed);
        let c = saved.counts();
        assert_eq!((c.critical, c.high, c.medium, c.low), (0, 0, 0, 1));
        assert!(saved.raw_output.as_ref().unwrap().0.get("recon").is_some());

        let findings = p.lifecycle().store().list_findings(&job.id).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[0].module, "recon");
        assert_eq!(findings[0].finding_type, "header_leak");
        assert_eq!(findings[0].description, "Server header exposes version");
    }

    #[tokio::test]
    async fn persisted_findings_match_payload_size() {
        let stdout = r#"{
            "web": {"injection": [{"type": "sql_injection", "description": "id param"},
                                  {"type": "xss", "description": "q param"}],
                    "config": [{"type": "directory_listing", "description": "/static"}]},
            "ssl": {"certs": [{"type": "expired_certificate", "description": "expired"}]}
        }"#;
        let p = pipeline(sqlite_store().await, exited(0, stdout, ""), None);
        let job = queue(&p, "shop.example.com", &["web", "ssl"]).await;
        p.run(&job).await;

        let store = p.lifecycle().store();
        assert_eq!(store.count_findings(&job.id).await.unwrap(), 4);
        let c = reload(&p, &job.id).await.counts();
        assert_eq!((c.critical, c.high, c.medium, c.low), (1, 2, 0, 1));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr() {
        let p = pipeline(sqlite_store().await, exited(1, "", "target unreachable\n"), None);
        let job = queue(&p, "10.9.9.9", &["recon"]).await;

        let outcome = p.run(&job).await;
        assert_eq!(outcome, PipelineOutcome::Failed { kind: "worker_exit_failure" });

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Error);
        let diag = saved.raw_output.unwrap().0;
        assert!(diag["error"]["message"].as_str().unwrap().contains("target unreachable"));
        assert_eq!(diag["stderr"], json!("target unreachable\n"));
        assert_eq!(diag["exit_code"], json!(1));
    }

    #[tokio::test]
    async fn output_without_json_is_malformed() {
        let p = pipeline(
            sqlite_store().await,
            exited(0, "scan finished, nothing to report\n", "debug noise"),
            None,
        );
        let job = queue(&p, "api.example.com", &["recon"]).await;

        assert_eq!(p.run(&job).await, PipelineOutcome::Failed { kind: "malformed_output" });

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Error);
        let diag = saved.raw_output.unwrap().0;
        assert_eq!(diag["error"]["kind"], json!("malformed_output"));
        assert_eq!(diag["stdout"], json!("scan finished, nothing to report\n"));
        assert_eq!(p.lifecycle().store().count_findings(&job.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn launch_failure_marks_job_error() {
        let p = pipeline(sqlite_store().await, Scripted::LaunchFails, None);
        let job = queue(&p, "api.example.com", &["recon"]).await;

        assert_eq!(p.run(&job).await, PipelineOutcome::Failed { kind: "process_launch_failure" });
        assert_eq!(reload(&p, &job.id).await.status, ScanStatus::Error);
    }

    #[tokio::test]
    async fn timeout_fails_with_partial_output() {
        let worker = Scripted::Output(WorkerOutput {
            exit_code: None,
            stdout: "[*] still probing".to_string(),
            stderr: String::new(),
            timed_out: true,
        });
        let p = pipeline(sqlite_store().await, worker, None);
        let job = queue(&p, "slow.example.com", &["web"]).await;

        assert_eq!(p.run(&job).await, PipelineOutcome::Failed { kind: "timeout" });
        let diag = reload(&p, &job.id).await.raw_output.unwrap().0;
        assert_eq!(diag["timed_out"], json!(true));
        assert_eq!(diag["stdout"], json!("[*] still probing"));
    }

    #[tokio::test]
    async fn one_bad_finding_does_not_block_completion() {
        let stdout = r#"{"web": {"x": [
            {"type": "xss", "description": "a"},
            {"type": "poison", "description": "b"},
            {"type": "csrf", "description": "c"}
        ]}}"#;
        let store: Arc<dyn ReportStore> =
            Arc::new(FlakyStore(SqliteReportStore::new(memory_pool().await)));
        let p = pipeline(store, exited(0, stdout, ""), None);
        let job = queue(&p, "api.example.com", &["web"]).await;

        assert!(matches!(p.run(&job).await, PipelineOutcome::Completed { findings: 2, .. }));
        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Completed);
        assert_eq!(saved.counts().total(), 3);
        assert_eq!(p.lifecycle().store().count_findings(&job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn enrichment_failure_leaves_completed_job_intact() {
        let p = pipeline(
            sqlite_store().await,
            exited(0, RECON_STDOUT, ""),
            Some(Generator(Err("connection reset".to_string()))),
        );
        let job = queue(&p, "api.example.com", &["recon"]).await;
        let PipelineOutcome::Completed { raw, .. } = p.run(&job).await else {
            panic!("scan should complete");
        };
        p.enrich(&job.id, &raw).await;

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Completed);
        assert_eq!(saved.counts().low, 1);
        assert!(saved.raw_output.is_some());
        assert!(saved.enhanced_report.is_none());
    }

    #[tokio::test]
    async fn invalid_enrichment_shape_is_swallowed() {
        let p = pipeline(
            sqlite_store().await,
            exited(0, RECON_STDOUT, ""),
            Some(Generator(Ok(r#"{"executive_summary": "only this"}"#.to_string()))),
        );
        let job = queue(&p, "api.example.com", &["recon"]).await;
        let PipelineOutcome::Completed { raw, .. } = p.run(&job).await else {
            panic!("scan should complete");
        };
        p.enrich(&job.id, &raw).await;

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Completed);
        assert!(saved.enhanced_report.is_none());
    }

    #[tokio::test]
    async fn enrichment_success_attaches_report_without_touching_status() {
        let reply = json!({
            "executive_summary": "Version disclosure only.",
            "risk_assessment": {"overall_risk": "low", "risk_factors": []},
            "vulnerabilities": [],
            "recommendations": [{"title": "Hide banner", "priority": "low"}]
        })
        .to_string();
        let p = pipeline(
            sqlite_store().await,
            exited(0, RECON_STDOUT, ""),
            Some(Generator(Ok(reply))),
        );
        let job = queue(&p, "api.example.com", &["recon"]).await;
        let PipelineOutcome::Completed { raw, .. } = p.run(&job).await else {
            panic!("scan should complete");
        };
        p.enrich(&job.id, &raw).await;

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Completed);
        assert_eq!(saved.counts().low, 1);
        let report = saved.enhanced_report.unwrap().0;
        assert_eq!(report.executive_summary, "Version disclosure only.");
        assert_eq!(report.recommendations[0].title, "Hide banner");
    }

    #[tokio::test]
    async fn enrichment_never_attaches_to_failed_job() {
        let reply = json!({
            "executive_summary": "x",
            "risk_assessment": {"overall_risk": "low"},
            "vulnerabilities": [],
            "recommendations": []
        })
        .to_string();
        let p = pipeline(sqlite_store().await, exited(2, "", "boom"), Some(Generator(Ok(reply))));
        let job = queue(&p, "api.example.com", &["recon"]).await;
        p.run(&job).await;
        p.enrich(&job.id, &json!({"recon": {}})).await;

        let saved = reload(&p, &job.id).await;
        assert_eq!(saved.status, ScanStatus::Error);
        assert!(saved.enhanced_report.is_none());
    }

    #[test]
    fn rate_limiter_caps_requests_per_window() {
        let mut limiter = RateLimiter::new(2);
        let t0 = Instant::now();
        assert!(limiter.allow_at(t0));
        assert!(limiter.allow_at(t0 + Duration::from_secs(1)));
        assert!(!limiter.allow_at(t0 + Duration::from_secs(2)));
        assert!(limiter.allow_at(t0 + Duration::from_secs(61)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dispatcher_runs_queued_scans_to_terminal_state() {
        use std::path::PathBuf;

        use crate::{adapters::ProcessWorker, config::WorkerConfig};

        let script = r#"
            echo "[*] scanning $1"
            if [ "$1" = "down.example.com" ]; then echo "target unreachable" >&2; exit 1; fi
            printf '{"recon":{"info_disclosure":[{"type":"header_leak","description":"banner"}]}}'
        "#;
        let worker = ProcessWorker::new(&WorkerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
            module_dir: PathBuf::from("."),
            module_path_var: "SCANPIPE_TEST_MODULE_PATH".to_string(),
            default_modules: vec![],
            timeout_secs: 20,
        });
        let store = sqlite_store().await;
        let p = Arc::new(ScanPipeline::new(
            Arc::new(worker),
            ReportLifecycle::new(store.clone(), SeverityTable::builtin()),
            None,
        ));

        let (tx, rx) = mpsc::channel(8);
        let mut ids = Vec::new();
        for target in ["a.example.com", "down.example.com", "b.example.com"] {
            let job = queue(&p, target, &["recon"]).await;
            ids.push(job.id.clone());
            tx.send(job).await.unwrap();
        }
        drop(tx);
        worker_loop(p.clone(), rx, 2).await;

        let mut statuses = Vec::new();
        for id in &ids {
            let mut status = ScanStatus::InProgress;
            for _ in 0..100 {
                status = store.get_job(id).await.unwrap().unwrap().status;
                if status != ScanStatus::InProgress {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            statuses.push(status);
        }
        assert_eq!(
            statuses,
            vec![ScanStatus::Completed, ScanStatus::Error, ScanStatus::Completed]
        );
    }
}
