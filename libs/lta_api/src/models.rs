//! Wire types shared between the LTA DB, the File Catalog clients and the
//! worker components.
//!
//! Everything here is plain data: the REST clients in the service crate do
//! the I/O. Statuses serialize in lower case, matching what the LTA DB
//! stores and what `pop` filters on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a TransferRequest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RequestStatus {
    Ethereal,
    Specified,
    Quarantined,
}

/// Lifecycle of a Bundle.
///
/// `Located` is the entry state of the restore direction; it flows into the
/// same transferring/taping track as the archival direction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BundleStatus {
    Specified,
    Created,
    Transferring,
    Taping,
    Completed,
    Deleted,
    Located,
    Quarantined,
}

impl BundleStatus {
    /// Terminal states are never popped again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BundleStatus::Deleted | BundleStatus::Quarantined)
    }
}

/// The checksum pair recorded for every archive: adler32 (8 hex chars) and
/// SHA-512 (128 hex chars), both lower case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub adler32: String,
    pub sha512: String,
}

/// A user's intent to move a logical path between two named sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub uuid: String,
    pub source: String,
    pub dest: String,
    pub path: String,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_status: Option<RequestStatus>,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimant: Option<String>,
    #[serde(default)]
    pub claimed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_priority_timestamp: Option<DateTime<Utc>>,
}

/// One archive unit in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub uuid: String,
    /// Owning TransferRequest uuid.
    pub request: String,
    pub source: String,
    pub dest: String,
    pub path: String,
    pub status: BundleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_status: Option<BundleStatus>,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimant: Option<String>,
    #[serde(default)]
    pub claimed: bool,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_reference: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogProjection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_priority_timestamp: Option<DateTime<Utc>>,
}

/// Join row between a Bundle and one File Catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_uuid: Option<String>,
    pub file_catalog_uuid: String,
}

/// The cherry-picked subset of a File Catalog record that travels inside a
/// Bundle. Everything else the catalog knows about the file is stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProjection {
    pub checksum: serde_json::Value,
    pub file_size: u64,
    pub logical_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_modify_date: Option<String>,
    pub uuid: String,
}

#[derive(Debug, thiserror::Error)]
#[error("File Catalog record is missing required key '{0}'")]
pub struct ProjectionError(pub &'static str);

impl CatalogProjection {
    /// Project a full File Catalog record down to the keys a Bundle keeps.
    pub fn from_record(record: &serde_json::Value) -> Result<Self, ProjectionError> {
        let get = |key: &'static str| record.get(key).ok_or(ProjectionError(key));
        Ok(CatalogProjection {
            checksum: get("checksum")?.clone(),
            file_size: get("file_size")?
                .as_u64()
                .ok_or(ProjectionError("file_size"))?,
            logical_name: get("logical_name")?
                .as_str()
                .ok_or(ProjectionError("logical_name"))?
                .to_string(),
            meta_modify_date: record
                .get("meta_modify_date")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            uuid: get("uuid")?
                .as_str()
                .ok_or(ProjectionError("uuid"))?
                .to_string(),
        })
    }
}

/// First line of the `<uuid>.metadata.ndjson` sidecar written by the Bundler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub uuid: String,
    pub component: String,
    pub version: u32,
    pub create_timestamp: DateTime<Utc>,
    pub file_count: u64,
}

// ------------------------------------------------------------------------
// LTA DB protocol bodies
// ------------------------------------------------------------------------

/// Body of every `pop` call. The server records the claimant on the row it
/// hands out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopBody {
    pub claimant: String,
}

#[derive(Debug, Deserialize)]
pub struct PopTransferRequestResponse {
    pub transfer_request: Option<TransferRequest>,
}

#[derive(Debug, Deserialize)]
pub struct PopBundleResponse {
    pub bundle: Option<Bundle>,
}

/// Creation form for a Bundle; uuid and timestamps are assigned by the LTA DB.
#[derive(Debug, Clone, Serialize)]
pub struct BundleSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: BundleStatus,
    pub reason: String,
    pub request: String,
    pub source: String,
    pub dest: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogProjection>,
    pub claimed: bool,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateBundlesBody {
    pub bundles: Vec<BundleSpec>,
}

#[derive(Debug, Deserialize)]
pub struct BulkCreateBundlesResponse {
    /// Uuids of the created bundles, in creation order.
    pub bundles: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateMetadataBody {
    pub bundle_uuid: String,
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkCreateMetadataResponse {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct MetadataPage {
    pub results: Vec<MetadataRecord>,
}

/// Partial update of a TransferRequest. Only populated fields are sent; the
/// LTA DB validates the status transition server-side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferRequestPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_status: Option<RequestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_priority_timestamp: Option<DateTime<Utc>>,
}

/// Partial update of a Bundle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundlePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BundleStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_status: Option<BundleStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogProjection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_priority_timestamp: Option<DateTime<Utc>>,
}

// ------------------------------------------------------------------------
// File Catalog bodies
// ------------------------------------------------------------------------

/// One page of `GET /api/files`. With `keys=uuid|file_size` each entry holds
/// only those two fields; a full fetch returns complete records as raw JSON.
#[derive(Debug, Deserialize)]
pub struct CatalogFilesPage {
    pub files: Vec<serde_json::Value>,
}

/// Entry shape when paging with `keys=uuid|file_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFileStub {
    pub uuid: String,
    #[serde(default)]
    pub file_size: u64,
}

/// A `locations` entry on a File Catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogLocation {
    pub site: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_in_lower_case() {
        let s = serde_json::to_string(&BundleStatus::Transferring).unwrap();
        assert_eq!(s, "\"transferring\"");
        let parsed: BundleStatus = serde_json::from_str("\"taping\"").unwrap();
        assert_eq!(parsed, BundleStatus::Taping);
        assert_eq!(BundleStatus::Specified.to_string(), "specified");
        assert_eq!(
            "quarantined".parse::<RequestStatus>().unwrap(),
            RequestStatus::Quarantined
        );
    }

    #[test]
    fn patch_serializes_only_populated_fields() {
        let patch = BundlePatch {
            status: Some(BundleStatus::Created),
            size: Some(42),
            ..Default::default()
        };
        let value = serde_json::to_value(&patch).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["status"], "created");
        assert_eq!(obj["size"], 42);
    }

    #[test]
    fn projection_keeps_the_five_keys() {
        let record = serde_json::json!({
            "uuid": "dd160a96-95b8-4629-9a54-7cee2a92a4a3",
            "logical_name": "/data/exp/IceCube/2018/unbiased/PFDST/1120/f1.tar.bz2",
            "file_size": 103_166_718u64,
            "checksum": {"sha512": "0123"},
            "meta_modify_date": "2019-07-26 01:04:51.400263",
            "locations": [{"site": "WIPAC", "path": "/data/exp"}],
            "processing_level": "PFDST",
        });
        let projection = CatalogProjection::from_record(&record).unwrap();
        assert_eq!(projection.file_size, 103_166_718);
        assert_eq!(
            projection.meta_modify_date.as_deref(),
            Some("2019-07-26 01:04:51.400263")
        );
        let value = serde_json::to_value(&projection).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 5);
        assert!(obj.get("locations").is_none());
    }

    #[test]
    fn projection_rejects_incomplete_records() {
        let record = serde_json::json!({"uuid": "abc"});
        assert!(CatalogProjection::from_record(&record).is_err());
    }

    #[test]
    fn bundle_spec_serializes_its_entity_type() {
        let spec = BundleSpec {
            kind: "Bundle".to_string(),
            status: BundleStatus::Specified,
            reason: String::new(),
            request: "req-1".to_string(),
            source: "WIPAC".to_string(),
            dest: "NERSC".to_string(),
            path: "/data/exp".to_string(),
            file_count: Some(3),
            size: None,
            bundle_path: None,
            checksum: None,
            catalog: None,
            claimed: false,
            verified: false,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], "Bundle");
        assert_eq!(value["status"], "specified");
        assert_eq!(value["file_count"], 3);
        assert!(value.get("size").is_none());
    }

    #[test]
    fn manifest_header_round_trips() {
        let header = ManifestHeader {
            uuid: "0869ea50e4b3e8b4e1c4a9e5".to_string(),
            component: "bundler".to_string(),
            version: crate::MANIFEST_VERSION,
            create_timestamp: chrono::Utc::now(),
            file_count: 107,
        };
        let line = serde_json::to_string(&header).unwrap();
        let parsed: ManifestHeader = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.component, "bundler");
        assert_eq!(parsed.file_count, 107);
    }
}
