//! Client for the File Catalog: the authoritative record of warehouse files
//! and their archive locations.
//!
//! Queries are typed builders over the catalog's mongo-style selector
//! language; only `$eq` and `^`-anchored `$regex` are ever produced.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lta_api::models::{CatalogFileStub, CatalogFilesPage, CatalogLocation};

use crate::auth::{AuthError, TokenProvider};
use crate::backoff;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("receive body: {0}")]
    ReceiveBody(reqwest::Error),

    #[error("File Catalog API {0}: {1}")]
    ApiError(StatusCode, String),

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("shutting down")]
    Cancelled,
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::ReceiveBody(_) => true,
            CatalogError::ApiError(status, _) => status.is_server_error(),
            CatalogError::Auth(AuthError::Transport(_)) => true,
            CatalogError::Auth(AuthError::Rejected(_)) => false,
            CatalogError::Cancelled => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Deserialize)]
struct HttpErrorBody {
    msg: String,
}

/// Selector over catalog records. Produces the JSON the catalog expects in
/// its `query` parameter.
#[derive(Debug, Default, Clone)]
pub struct CatalogQuery {
    selectors: serde_json::Map<String, Value>,
}

impl CatalogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(mut self, site: &str) -> Self {
        self.selectors
            .insert("locations.site".into(), json!({"$eq": site}));
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.selectors
            .insert("locations.archive".into(), json!({"$eq": archived}));
        self
    }

    pub fn location_path_prefix(mut self, prefix: &str) -> Self {
        self.selectors.insert(
            "locations.path".into(),
            json!({"$regex": format!("^{prefix}")}),
        );
        self
    }

    pub fn logical_name_prefix(mut self, prefix: &str) -> Self {
        self.selectors.insert(
            "logical_name".into(),
            json!({"$regex": format!("^{prefix}")}),
        );
        self
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.selectors.clone()).to_string()
    }
}

pub struct FileCatalogClient {
    endpoint: String,
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    retries: u32,
    cancel: CancellationToken,
}

impl FileCatalogClient {
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

    /// One page of matching records, each narrowed to `keys`.
    pub async fn find_files(
        &self,
        query: &CatalogQuery,
        keys: &[&str],
        limit: usize,
        start: usize,
    ) -> Result<Vec<Value>> {
        let uri = format!("{}/api/files", self.endpoint);
        let params = [
            ("query", query.to_json()),
            ("keys", keys.join("|")),
            ("limit", limit.to_string()),
            ("start", start.to_string()),
        ];
        let page: CatalogFilesPage = self.request(Method::GET, &uri, Some(&params), &()).await?;
        Ok(page.files)
    }

    /// Page through every `{uuid, file_size}` stub matching the query.
    pub async fn find_all_stubs(
        &self,
        query: &CatalogQuery,
        page_size: usize,
    ) -> Result<Vec<CatalogFileStub>> {
        let mut stubs: Vec<CatalogFileStub> = Vec::new();
        let mut start = 0;
        loop {
            let page = self
                .find_files(query, &["uuid", "file_size"], page_size, start)
                .await?;
            let num_files = page.len();
            debug!("File Catalog returned {num_files} file(s) at offset {start}");
            for value in page {
                let stub: CatalogFileStub = serde_json::from_value(value).map_err(|e| {
                    CatalogError::ApiError(StatusCode::OK, format!("malformed stub: {e}"))
                })?;
                stubs.push(stub);
            }
            if num_files == 0 {
                break;
            }
            start += num_files;
        }
        Ok(stubs)
    }

    /// The complete record for one file.
    pub async fn get_record(&self, uuid: &str) -> Result<Value> {
        let uri = format!("{}/api/files/{uuid}", self.endpoint);
        self.request(Method::GET, &uri, None, &()).await
    }

    /// Register a new record. An already-existing record (409) is tolerated
    /// so that re-running a cataloging cycle stays idempotent.
    pub async fn create_record(&self, record: &Value) -> Result<()> {
        let uri = format!("{}/api/files", self.endpoint);
        match self
            .request::<_, Value>(Method::POST, &uri, None, record)
            .await
        {
            Ok(_) => Ok(()),
            Err(CatalogError::ApiError(StatusCode::CONFLICT, _)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn patch_record(&self, uuid: &str, patch: &Value) -> Result<Value> {
        let uri = format!("{}/api/files/{uuid}", self.endpoint);
        self.request(Method::PATCH, &uri, None, patch).await
    }

    /// Append a location to a record unless an equal one is already there.
    pub async fn add_location(&self, uuid: &str, location: &CatalogLocation) -> Result<()> {
        let record = self.get_record(uuid).await?;
        let mut locations: Vec<CatalogLocation> = record
            .get("locations")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                CatalogError::ApiError(StatusCode::OK, format!("malformed locations: {e}"))
            })?
            .unwrap_or_default();
        let already_there = locations
            .iter()
            .any(|l| l.site == location.site && l.path == location.path);
        if already_there {
            return Ok(());
        }
        locations.push(location.clone());
        let patch = json!({ "locations": locations });
        self.patch_record(uuid, &patch).await?;
        Ok(())
    }

    async fn request<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        uri: &str,
        params: Option<&[(&str, String)]>,
        body: &B,
    ) -> Result<T> {
        let description = format!("File Catalog {method} {uri}");
        backoff::retry(
            || self.request_once(method.clone(), uri, params, body),
            |e: &CatalogError| !e.is_transient(),
            1,
            self.retries,
            &description,
            &self.cancel,
        )
        .await
        .ok_or(CatalogError::Cancelled)?
    }

    async fn request_once<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        uri: &str,
        params: Option<&[(&str, String)]>,
        body: &B,
    ) -> Result<T> {
        let bearer = self.tokens.bearer().await?;
        let mut request = self.http.request(method, uri).bearer_auth(bearer);
        if let Some(params) = params {
            request = request.query(params);
        }
        let response = request
            .json(body)
            .send()
            .await
            .map_err(CatalogError::ReceiveBody)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let msg = match response.json::<HttpErrorBody>().await {
                Ok(body) => body.msg,
                Err(_) => format!("HTTP error {} at {uri}", status.as_u16()),
            };
            return Err(CatalogError::ApiError(status, msg));
        }
        let bytes = response.bytes().await.map_err(CatalogError::ReceiveBody)?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| CatalogError::ApiError(status, format!("malformed body: {e}")))?
        };
        serde_json::from_value(value)
            .map_err(|e| CatalogError::ApiError(status, format!("unexpected body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builds_anchored_selectors() {
        let query = CatalogQuery::new()
            .site("WIPAC")
            .location_path_prefix("/data/exp/IceCube/2018")
            .logical_name_prefix("/data/exp/IceCube/2018");
        let value: Value = serde_json::from_str(&query.to_json()).unwrap();
        assert_eq!(value["locations.site"]["$eq"], "WIPAC");
        assert_eq!(
            value["locations.path"]["$regex"],
            "^/data/exp/IceCube/2018"
        );
        assert_eq!(
            value["logical_name"]["$regex"],
            "^/data/exp/IceCube/2018"
        );
    }

    #[test]
    fn restore_query_filters_on_archived_locations() {
        let query = CatalogQuery::new().archived(true).site("NERSC");
        let value: Value = serde_json::from_str(&query.to_json()).unwrap();
        assert_eq!(value["locations.archive"]["$eq"], true);
        assert_eq!(value["locations.site"]["$eq"], "NERSC");
    }
}
