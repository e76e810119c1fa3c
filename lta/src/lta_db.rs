//! Client for the LTA DB REST service: atomic pops, partial updates, bulk
//! creation, and the Metadata pages that drive the Bundler.
//!
//! Transport errors and 5xx responses are retried with backoff up to the
//! configured `WORK_RETRIES`; 4xx responses are protocol errors and surface
//! immediately. The server validates status transitions on every PATCH.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lta_api::models::{
    Bundle, BundlePatch, BulkCreateBundlesBody, BulkCreateBundlesResponse,
    BulkCreateMetadataBody, BulkCreateMetadataResponse, BundleSpec, BundleStatus, MetadataPage,
    MetadataRecord, PopBody, PopBundleResponse, PopTransferRequestResponse, TransferRequest,
    TransferRequestPatch,
};

use crate::auth::{AuthError, TokenProvider};
use crate::backoff;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("receive body: {0}")]
    ReceiveBody(reqwest::Error),

    #[error("LTA DB API {0}: {1}")]
    ApiError(StatusCode, String),

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("shutting down")]
    Cancelled,
}

impl DbError {
    /// Transient errors are worth retrying; everything else is a protocol
    /// violation or a rejected transition.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::ReceiveBody(_) => true,
            DbError::ApiError(status, _) => status.is_server_error(),
            DbError::Auth(AuthError::Transport(_)) => true,
            DbError::Auth(AuthError::Rejected(_)) => false,
            DbError::Cancelled => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Error body shape shared by the LTA DB and the File Catalog.
#[derive(Deserialize)]
struct HttpErrorBody {
    msg: String,
}

pub struct LtaDbClient {
    endpoint: String,
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    retries: u32,
    cancel: CancellationToken,
}

impl LtaDbClient {
    pub fn new(
        endpoint: &url::Url,
        tokens: Arc<TokenProvider>,
        timeout: Duration,
        retries: u32,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().timeout(timeout).build()?,
            tokens,
            retries,
            cancel,
        })
    }

    /// Claim the next eligible TransferRequest for `source` → `dest`, or
    /// None when there is no work.
    pub async fn pop_transfer_request(
        &self,
        source: &str,
        dest: &str,
        claimant: &str,
    ) -> Result<Option<TransferRequest>> {
        let path = format!("/TransferRequests/actions/pop?source={source}&dest={dest}");
        let response: PopTransferRequestResponse = self
            .request(
                Method::POST,
                &path,
                &PopBody {
                    claimant: claimant.to_string(),
                },
            )
            .await?;
        Ok(response.transfer_request)
    }

    /// Claim the next eligible Bundle at `status` for `source` → `dest`.
    pub async fn pop_bundle(
        &self,
        source: &str,
        dest: &str,
        status: BundleStatus,
        claimant: &str,
    ) -> Result<Option<Bundle>> {
        let path = format!("/Bundles/actions/pop?source={source}&dest={dest}&status={status}");
        let response: PopBundleResponse = self
            .request(
                Method::POST,
                &path,
                &PopBody {
                    claimant: claimant.to_string(),
                },
            )
            .await?;
        Ok(response.bundle)
    }

    /// Create bundles, returning their uuids in creation order.
    pub async fn bulk_create_bundles(&self, bundles: Vec<BundleSpec>) -> Result<Vec<String>> {
        let response: BulkCreateBundlesResponse = self
            .request(
                Method::POST,
                "/Bundles/actions/bulk_create",
                &BulkCreateBundlesBody { bundles },
            )
            .await?;
        Ok(response.bundles)
    }

    /// Map a chunk of File Catalog uuids onto a Bundle.
    pub async fn bulk_create_metadata(
        &self,
        bundle_uuid: &str,
        files: Vec<String>,
    ) -> Result<usize> {
        let response: BulkCreateMetadataResponse = self
            .request(
                Method::POST,
                "/Metadata/actions/bulk_create",
                &BulkCreateMetadataBody {
                    bundle_uuid: bundle_uuid.to_string(),
                    files,
                },
            )
            .await?;
        Ok(response.count)
    }

    /// One page of Metadata rows for a Bundle. An empty page means the end.
    pub async fn metadata_page(
        &self,
        bundle_uuid: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<MetadataRecord>> {
        let path = format!("/Metadata?bundle_uuid={bundle_uuid}&limit={limit}&skip={skip}");
        let page: MetadataPage = self.request(Method::GET, &path, &()).await?;
        Ok(page.results)
    }

    pub async fn patch_transfer_request(
        &self,
        uuid: &str,
        patch: &TransferRequestPatch,
    ) -> Result<()> {
        let path = format!("/TransferRequests/{uuid}");
        let _: serde_json::Value = self.request(Method::PATCH, &path, patch).await?;
        Ok(())
    }

    pub async fn patch_bundle(&self, uuid: &str, patch: &BundlePatch) -> Result<()> {
        let path = format!("/Bundles/{uuid}");
        let _: serde_json::Value = self.request(Method::PATCH, &path, patch).await?;
        Ok(())
    }

    /// Re-assert the lease on a Bundle before a destructive side effect.
    ///
    /// The PATCH carries our own claimant; the server compares-and-sets and
    /// answers 409 when somebody else holds the row. Returns whether the
    /// lease is still ours.
    pub async fn confirm_bundle_claim(&self, uuid: &str, claimant: &str) -> Result<bool> {
        let path = format!("/Bundles/{uuid}");
        let patch = BundlePatch {
            claimant: Some(claimant.to_string()),
            update_timestamp: Some(chrono::Utc::now()),
            ..Default::default()
        };
        match self
            .request::<_, serde_json::Value>(Method::PATCH, &path, &patch)
            .await
        {
            Ok(_) => Ok(true),
            Err(DbError::ApiError(StatusCode::CONFLICT, _)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Heartbeat: report component liveness to the status endpoint.
    pub async fn post_status(&self, component: &str, body: &serde_json::Value) -> Result<()> {
        let path = format!("/status/{component}");
        let _: serde_json::Value = self.request(Method::POST, &path, body).await?;
        Ok(())
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        debug_assert!(path.starts_with('/'));
        let uri = format!("{}{}", self.endpoint, path);
        let description = format!("LTA DB {method} {path}");
        backoff::retry(
            || self.request_once(method.clone(), &uri, body),
            |e: &DbError| !e.is_transient(),
            1,
            self.retries,
            &description,
            &self.cancel,
        )
        .await
        .ok_or(DbError::Cancelled)?
    }

    async fn request_once<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        uri: &str,
        body: &B,
    ) -> Result<T> {
        let bearer = self.tokens.bearer().await?;
        debug!("{method} {uri}");
        let response = self
            .http
            .request(method, uri)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(DbError::ReceiveBody)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let msg = match response.json::<HttpErrorBody>().await {
                Ok(body) => body.msg,
                Err(_) => format!("HTTP error {} at {uri}", status.as_u16()),
            };
            return Err(DbError::ApiError(status, msg));
        }
        let bytes = response.bytes().await.map_err(DbError::ReceiveBody)?;
        // PATCH endpoints may answer with an empty body.
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| DbError::ApiError(status, format!("malformed body: {e}")))?
        };
        serde_json::from_value(value)
            .map_err(|e| DbError::ApiError(status, format!("unexpected body: {e}")))
    }
}
