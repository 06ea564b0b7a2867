use std::{
    ffi::OsString,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, warn};

use crate::{config::WorkerConfig, error::PipelineError};

/// How long to wait for stream readers after the child has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: String,
    pub modules: Vec<String>,
}

/// Everything the worker produced, captured per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl WorkerOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait::async_trait]
pub trait ScanWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Upper bound on a single run.
    fn timeout(&self) -> Duration;

    /// Runs one scan to completion. Only a failure to start the process is an
    /// error; exit status and output are reported in [`WorkerOutput`].
    async fn run(&self, req: ScanRequest) -> Result<WorkerOutput, PipelineError>;
}

/// Runs the scanning worker as a child process.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    module_dir: PathBuf,
    module_path_var: String,
    timeout: Duration,
}

impl ProcessWorker {
    pub fn new(cfg: &WorkerConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            module_dir: cfg.module_dir.clone(),
            module_path_var: cfg.module_path_var.clone(),
            timeout: cfg.timeout(),
        }
    }

    /// Worker module directory prepended to any inherited search path.
    fn search_path(&self) -> OsString {
        let mut paths = vec![self.module_dir.clone()];
        if let Some(existing) = std::env::var_os(&self.module_path_var) {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).unwrap_or_else(|_| self.module_dir.clone().into_os_string())
    }
}

#[async_trait::async_trait]
impl ScanWorker for ProcessWorker {
    fn name(&self) -> &str {
        &self.program
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, req: ScanRequest) -> Result<WorkerOutput, PipelineError> {
        info!(
            program = %self.program,
            target = %req.target,
            modules = ?req.modules,
            "audit: launching scan worker"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&req.target)
            .args(&req.modules)
            .env(&self.module_path_var, self.search_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::ProcessLaunch {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(drain(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain(s)));

        let (exit_code, timed_out) = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                warn!(error = %e, target = %req.target, "failed waiting on worker");
                (None, false)
            }
            Err(_) => {
                warn!(
                    target = %req.target,
                    after_secs = self.timeout.as_secs(),
                    "worker timed out; killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill worker");
                }
                (None, true)
            }
        };

        let grace = if timed_out { Some(DRAIN_GRACE) } else { None };
        Ok(WorkerOutput {
            exit_code,
            stdout: collect(stdout, grace).await,
            stderr: collect(stderr, grace).await,
            timed_out,
        })
    }
}

/// Reads a stream to EOF, keeping every byte including a trailing partial line.
async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                warn!(error = %e, "worker stream read failed");
                break;
            }
        }
    }
    buf
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>, grace: Option<Duration>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    let joined = match grace {
        None => handle.await,
        Some(grace) => match timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // A grandchild may still hold the pipe open.
                handle.abort();
                warn!("stream still open after worker was killed; dropping it");
                return String::new();
            }
        },
    };
    match joined {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "stream reader task failed");
            String::new()
        }
    }
}
