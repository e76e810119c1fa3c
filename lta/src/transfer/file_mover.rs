//! Local filesystem transfer driver.
//!
//! Stands in for the grid service in tests and single-host deployments:
//! `file:` destination URLs are plain paths, a submit is a local copy that
//! completes before the task id is handed back, and the status table only
//! ever answers for tasks this process submitted.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;
use url::Url;
use uuid::Uuid;

use super::{TransferBackend, TransferTaskStatus};

pub struct FileMover {
    tasks: Mutex<HashMap<String, TransferTaskStatus>>,
}

impl FileMover {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn local_path(url: &Url) -> anyhow::Result<Utf8PathBuf> {
        if !matches!(url.scheme(), "file") {
            bail!("file mover only handles file:// urls, got {url}");
        }
        Ok(Utf8PathBuf::from(url.path()))
    }
}

impl Default for FileMover {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferBackend for FileMover {
    fn scheme(&self) -> &'static str {
        "move"
    }

    async fn refresh_credentials(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn submit(&self, source_path: &Utf8Path, dest_url: &Url) -> anyhow::Result<String> {
        if !source_path.is_absolute() {
            bail!("source path must be absolute: {source_path}");
        }
        let dest_path = Self::local_path(dest_url)?;
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating destination directory {parent}"))?;
        }
        let task_id = Uuid::new_v4().to_string();
        let result = tokio::fs::copy(source_path, &dest_path)
            .await
            .with_context(|| format!("copying {source_path} to {dest_path}"));
        let status = match &result {
            Ok(_) => TransferTaskStatus::Succeeded,
            Err(_) => TransferTaskStatus::Failed,
        };
        self.tasks
            .lock()
            .expect("task table lock poisoned")
            .insert(task_id.clone(), status);
        result?;
        info!("local transfer {task_id}: {source_path} -> {dest_path}");
        Ok(task_id)
    }

    async fn poll(&self, task_id: &str) -> anyhow::Result<TransferTaskStatus> {
        let status = self
            .tasks
            .lock()
            .expect("task table lock poisoned")
            .get(task_id)
            .copied()
            // A task we never heard of belongs to a dead replica.
            .unwrap_or(TransferTaskStatus::Inactive);
        Ok(status)
    }

    async fn cancel(&self, _task_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch(&self, remote_url: &Url, local_path: &Utf8Path) -> anyhow::Result<()> {
        let remote_path = Self::local_path(remote_url)?;
        tokio::fs::copy(&remote_path, local_path)
            .await
            .with_context(|| format!("copying {remote_path} to {local_path}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn submit_copies_and_reports_success() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("bundle.zip");
        std::fs::write(&source, b"zip bytes").unwrap();
        let dest_dir = dir.path().join("dest");
        let dest_url =
            Url::parse(&format!("file://{}", dest_dir.join("bundle.zip"))).unwrap();

        let mover = FileMover::new();
        let task_id = mover.submit(&source, &dest_url).await.unwrap();
        assert_eq!(
            mover.poll(&task_id).await.unwrap(),
            TransferTaskStatus::Succeeded
        );
        assert_eq!(
            std::fs::read(dest_dir.join("bundle.zip")).unwrap(),
            b"zip bytes"
        );
    }

    #[tokio::test]
    async fn unknown_tasks_poll_as_inactive() {
        let mover = FileMover::new();
        assert_eq!(
            mover.poll("never-submitted").await.unwrap(),
            TransferTaskStatus::Inactive
        );
    }

    #[tokio::test]
    async fn fetch_round_trips_the_destination_copy() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("remote.zip");
        std::fs::write(&remote, b"remote bytes").unwrap();
        let scratch = dir.path().join("scratch.zip");
        let remote_url = Url::parse(&format!("file://{remote}")).unwrap();

        let mover = FileMover::new();
        mover.fetch(&remote_url, &scratch).await.unwrap();
        assert_eq!(std::fs::read(&scratch).unwrap(), b"remote bytes");
    }

    #[tokio::test]
    async fn non_file_urls_are_rejected() {
        let mover = FileMover::new();
        let source = Utf8PathBuf::from("/tmp/whatever.zip");
        let dest = Url::parse("https://example.org/bundle.zip").unwrap();
        assert!(mover.submit(&source, &dest).await.is_err());
    }
}
