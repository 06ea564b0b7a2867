use crate::{
    models::{ProgressState, ScanJob, ScanProgress, ScanStatus},
    store::ReportStore,
};

fn progress_of(job: Option<&ScanJob>) -> ScanProgress {
    let Some(job) = job else {
        return ScanProgress {
            status: ProgressState::Idle,
            progress: 0,
            findings_count: 0,
        };
    };
    let progress = match job.status {
        ScanStatus::InProgress => 50,
        ScanStatus::Completed => 100,
        ScanStatus::Error => 0,
    };
    ScanProgress {
        status: job.status.into(),
        progress,
        findings_count: job.counts().total(),
    }
}

/// Read-only; safe to poll.
pub async fn progress(store: &dyn ReportStore, id: &str) -> Result<ScanProgress, sqlx::Error> {
    let job = store.get_job(id).await?;
    Ok(progress_of(job.as_ref()))
}
