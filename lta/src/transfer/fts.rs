//! Driver for a grid file-transfer REST service (FTS-style).
//!
//! Jobs carry exactly one file each; the job id doubles as the task id in
//! transfer references.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use camino::Utf8Path;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::pathutil::join_url;

use super::{TransferBackend, TransferTaskStatus};

pub struct FtsBackend {
    endpoint: String,
    source_base: Url,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobResponse {
    job_state: String,
}

#[derive(Deserialize)]
struct WhoamiResponse {
    #[serde(default)]
    delegation_id: Option<String>,
}

impl FtsBackend {
    pub fn new(rest_url: &Url, source_base: &Url) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: rest_url.as_str().trim_end_matches('/').to_string(),
            source_base: source_base.clone(),
            http: reqwest::Client::builder().build()?,
        })
    }

    fn source_url(&self, source_path: &Utf8Path) -> anyhow::Result<Url> {
        if !source_path.is_absolute() {
            bail!("source path must be absolute: {source_path}");
        }
        Ok(join_url(&self.source_base, &[source_path.as_str()]))
    }
}

#[async_trait]
impl TransferBackend for FtsBackend {
    fn scheme(&self) -> &'static str {
        "fts"
    }

    async fn refresh_credentials(&self) -> anyhow::Result<()> {
        let uri = format!("{}/whoami", self.endpoint);
        let response = self
            .http
            .get(&uri)
            .send()
            .await
            .context("querying transfer service identity")?
            .error_for_status()
            .context("transfer service rejected our credentials")?;
        let whoami: WhoamiResponse = response.json().await.context("malformed whoami response")?;
        if let Some(delegation_id) = whoami.delegation_id {
            debug!("transfer service delegation id: {delegation_id}");
        }
        Ok(())
    }

    async fn submit(&self, source_path: &Utf8Path, dest_url: &Url) -> anyhow::Result<String> {
        let source_url = self.source_url(source_path)?;
        let job = json!({
            "files": [{
                "sources": [source_url.as_str()],
                "destinations": [dest_url.as_str()],
            }],
            "params": {
                "verify_checksum": false,
                "overwrite": true,
                "retry": 0,
                "priority": 3,
            },
        });
        let uri = format!("{}/jobs", self.endpoint);
        let response = self
            .http
            .post(&uri)
            .json(&job)
            .send()
            .await
            .context("submitting transfer job")?
            .error_for_status()
            .context("transfer service rejected the job")?;
        let submitted: SubmitResponse = response
            .json()
            .await
            .context("malformed job submission response")?;
        info!(
            "submitted transfer job {} for {source_path}",
            submitted.job_id
        );
        Ok(submitted.job_id)
    }

    async fn poll(&self, task_id: &str) -> anyhow::Result<TransferTaskStatus> {
        let uri = format!("{}/jobs/{task_id}", self.endpoint);
        let response = self
            .http
            .get(&uri)
            .send()
            .await
            .context("polling transfer job")?
            .error_for_status()
            .context("transfer service rejected the poll")?;
        let job: JobResponse = response.json().await.context("malformed job response")?;
        let status = match job.job_state.as_str() {
            "FINISHED" => TransferTaskStatus::Succeeded,
            "FAILED" => TransferTaskStatus::Failed,
            "CANCELED" => TransferTaskStatus::Inactive,
            "SUBMITTED" | "READY" | "ACTIVE" | "STAGING" => TransferTaskStatus::Active,
            other => return Err(anyhow!("unknown transfer job state '{other}'")),
        };
        Ok(status)
    }

    async fn cancel(&self, task_id: &str) -> anyhow::Result<()> {
        let uri = format!("{}/jobs/{task_id}", self.endpoint);
        self.http
            .delete(&uri)
            .send()
            .await
            .context("cancelling transfer job")?
            .error_for_status()
            .context("transfer service rejected the cancellation")?;
        Ok(())
    }

    async fn fetch(&self, remote_url: &Url, local_path: &Utf8Path) -> anyhow::Result<()> {
        let response = self
            .http
            .get(remote_url.clone())
            .send()
            .await
            .with_context(|| format!("fetching {remote_url}"))?
            .error_for_status()
            .with_context(|| format!("remote refused {remote_url}"))?;
        let mut file = tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("creating scratch file {local_path}"))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading {remote_url}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing scratch file {local_path}"))?;
        }
        file.flush()
            .await
            .with_context(|| format!("flushing scratch file {local_path}"))?;
        Ok(())
    }
}
