//! The byte-moving substrate: a narrow interface the pipeline depends on,
//! implemented by one driver per deployment flavor.

pub mod file_mover;
pub mod fts;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Terminal and non-terminal states a submitted transfer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferTaskStatus {
    Active,
    Succeeded,
    Failed,
    Inactive,
}

impl TransferTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferTaskStatus::Active)
    }
}

/// A transfer driver. Implementations must not leak credentials to logs.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Scheme recorded in transfer references, e.g. `fts/<task_id>`.
    fn scheme(&self) -> &'static str;

    /// Make sure the driver's credentials are fresh enough for a transfer.
    async fn refresh_credentials(&self) -> anyhow::Result<()>;

    /// Submit a transfer of one file; non-blocking, returns the task id.
    /// `source_path` must be absolute.
    async fn submit(&self, source_path: &Utf8Path, dest_url: &Url) -> anyhow::Result<String>;

    /// Current status of a submitted task.
    async fn poll(&self, task_id: &str) -> anyhow::Result<TransferTaskStatus>;

    /// Best-effort cancellation.
    async fn cancel(&self, task_id: &str) -> anyhow::Result<()>;

    /// Pull a full copy of a remote file to a local path; used by the
    /// verifiers to re-checksum the destination bytes.
    async fn fetch(&self, remote_url: &Url, local_path: &Utf8Path) -> anyhow::Result<()>;
}

/// Outcome of polling a task to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Terminal(TransferTaskStatus),
    TimedOut,
    Cancelled,
}

/// Poll `task_id` at `poll_interval` until it reaches a terminal state, the
/// deadline passes, or the worker is cancelled.
pub async fn wait_for_transfer(
    backend: &dyn TransferBackend,
    task_id: &str,
    poll_interval: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<WaitResult> {
    let started = tokio::time::Instant::now();
    loop {
        let status = backend.poll(task_id).await?;
        if status.is_terminal() {
            return Ok(WaitResult::Terminal(status));
        }
        if started.elapsed() >= deadline {
            return Ok(WaitResult::TimedOut);
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => return Ok(WaitResult::Cancelled),
        }
    }
}

/// Driver selection, from `TRANSFER_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Grid file-transfer REST service.
    Fts,
    /// Local filesystem driver for tests and single-host deployments.
    Move,
}

pub fn make_backend(
    kind: BackendKind,
    rest_url: Option<&Url>,
    source_url: Option<&Url>,
) -> anyhow::Result<Arc<dyn TransferBackend>> {
    match kind {
        BackendKind::Fts => {
            let rest_url =
                rest_url.ok_or_else(|| anyhow::anyhow!("fts backend requires TRANSFER_REST_URL"))?;
            let source_url = source_url
                .ok_or_else(|| anyhow::anyhow!("fts backend requires TRANSFER_SOURCE_URL"))?;
            Ok(Arc::new(fts::FtsBackend::new(rest_url, source_url)?))
        }
        BackendKind::Move => Ok(Arc::new(file_mover::FileMover::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowBackend;

    #[async_trait]
    impl TransferBackend for SlowBackend {
        fn scheme(&self) -> &'static str {
            "slow"
        }

        async fn refresh_credentials(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn submit(&self, _source: &Utf8Path, _dest: &Url) -> anyhow::Result<String> {
            Ok("task-1".into())
        }

        async fn poll(&self, _task_id: &str) -> anyhow::Result<TransferTaskStatus> {
            Ok(TransferTaskStatus::Active)
        }

        async fn cancel(&self, _task_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fetch(&self, _remote: &Url, _local: &Utf8Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn waiting_on_a_stuck_transfer_times_out() {
        let cancel = CancellationToken::new();
        let result = wait_for_transfer(
            &SlowBackend,
            "task-1",
            Duration::from_millis(1),
            Duration::from_millis(5),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result, WaitResult::TimedOut);
    }

    #[tokio::test]
    async fn waiting_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_transfer(
            &SlowBackend,
            "task-1",
            Duration::from_secs(3600),
            Duration::from_secs(7200),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result, WaitResult::Cancelled);
    }
}
