use chrono::Utc;
use serde_json::Value;
use sqlx::{types::Json, SqlitePool};
use uuid::Uuid;

use crate::models::{EnhancedReport, Finding, NewFinding, ScanJob, SeverityCounts};

const JOB_COLUMNS: &str = "id, target, modules, status, critical_count, high_count, medium_count, \
     low_count, raw_output, enhanced_report, created_at, finished_at";

/// Persistence seam for scan jobs and their findings.
///
/// Terminal transitions are guarded in the store: `complete_job` and
/// `fail_job` only apply to jobs still `in-progress` and report whether they
/// did anything.
#[async_trait::async_trait]
pub trait ReportStore: Send + Sync {
    async fn create_job(&self, target: &str, modules: &[String]) -> Result<ScanJob, sqlx::Error>;
    async fn get_job(&self, id: &str) -> Result<Option<ScanJob>, sqlx::Error>;
    async fn list_jobs(&self, limit: i64) -> Result<Vec<ScanJob>, sqlx::Error>;
    async fn insert_finding(&self, scan_id: &str, finding: &NewFinding) -> Result<String, sqlx::Error>;
    async fn list_findings(&self, scan_id: &str) -> Result<Vec<Finding>, sqlx::Error>;
    async fn count_findings(&self, scan_id: &str) -> Result<i64, sqlx::Error>;
    async fn complete_job(
        &self,
        id: &str,
        counts: SeverityCounts,
        raw_output: &Value,
    ) -> Result<bool, sqlx::Error>;
    async fn fail_job(&self, id: &str, diagnostic: &Value) -> Result<bool, sqlx::Error>;
    async fn attach_enhanced_report(
        &self,
        id: &str,
        report: &EnhancedReport,
    ) -> Result<bool, sqlx::Error>;
    async fn record_audit(&self, action: &str, actor: &str, details: &str) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct SqliteReportStore {
    pool: SqlitePool,
}

impl SqliteReportStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReportStore for SqliteReportStore {
    async fn create_job(&self, target: &str, modules: &[String]) -> Result<ScanJob, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO scan_jobs(id, target, modules, status, created_at) VALUES(?, ?, ?, 'in-progress', ?)",
        )
        .bind(&id)
        .bind(target)
        .bind(Json(modules))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_job(&id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    async fn get_job(&self, id: &str) -> Result<Option<ScanJob>, sqlx::Error> {
        sqlx::query_as::<_, ScanJob>(&format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ScanJob>, sqlx::Error> {
        sqlx::query_as::<_, ScanJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_finding(&self, scan_id: &str, finding: &NewFinding) -> Result<String, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO findings(id, scan_id, title, description, severity, module, category, finding_type, details, created_at) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(scan_id)
        .bind(&finding.title)
        .bind(&finding.description)
        .bind(finding.severity)
        .bind(&finding.module)
        .bind(&finding.category)
        .bind(&finding.finding_type)
        .bind(finding.details.as_ref().map(Json))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_findings(&self, scan_id: &str) -> Result<Vec<Finding>, sqlx::Error> {
        sqlx::query_as::<_, Finding>(
            "SELECT id, scan_id, title, description, severity, module, category, finding_type, details, created_at \
             FROM findings WHERE scan_id = ? ORDER BY created_at, rowid",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn count_findings(&self, scan_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM findings WHERE scan_id = ?")
            .bind(scan_id)
            .fetch_one(&self.pool)
            .await
    }

    async fn complete_job(
        &self,
        id: &str,
        counts: SeverityCounts,
        raw_output: &Value,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE scan_jobs SET status = 'completed', critical_count = ?, high_count = ?, \
             medium_count = ?, low_count = ?, raw_output = ?, finished_at = ? \
             WHERE id = ? AND status = 'in-progress'",
        )
        .bind(counts.critical)
        .bind(counts.high)
        .bind(counts.medium)
        .bind(counts.low)
        .bind(Json(raw_output))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn fail_job(&self, id: &str, diagnostic: &Value) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE scan_jobs SET status = 'error', raw_output = ?, finished_at = ? \
             WHERE id = ? AND status = 'in-progress'",
        )
        .bind(Json(diagnostic))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn attach_enhanced_report(
        &self,
        id: &str,
        report: &EnhancedReport,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE scan_jobs SET enhanced_report = ? WHERE id = ? AND status = 'completed'",
        )
        .bind(Json(report))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn record_audit(&self, action: &str, actor: &str, details: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO audit_log(action, actor, details, created_at) VALUES(?, ?, ?, ?)")
            .bind(action)
            .bind(actor)
            .bind(details)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
