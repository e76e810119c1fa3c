//! Locator: maps a restore TransferRequest (source = archive site, dest =
//! warehouse) onto the archive bundles that cover the requested path,
//! enqueuing them at *located*.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lta_api::models::{
    BundleSpec, BundleStatus, CatalogProjection, Checksum, RequestStatus, TransferRequest,
    TransferRequestPatch,
};

use crate::config::LocatorArgs;
use crate::file_catalog::{CatalogQuery, FileCatalogClient};
use crate::lta_db::LtaDbClient;
use crate::metrics::QUARANTINES;
use crate::pathutil::archive_uuid_from_location;
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Locator {
    claimant: String,
    source_site: String,
    dest_site: String,
    output_status: BundleStatus,
    page_size: usize,
    db: Arc<LtaDbClient>,
    catalog: FileCatalogClient,
}

impl Locator {
    pub fn new(args: &LocatorArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let name = args.common.component_name.as_deref().unwrap_or("locator");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            output_status: args.common.output_bundle_status(BundleStatus::Located)?,
            page_size: args.file_catalog.file_catalog_page_size,
            db: args.common.lta_db_client(cancel)?,
            catalog: args.file_catalog.client(&args.common, cancel)?,
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    async fn locate(&self, tr: &TransferRequest) -> Result<(), WorkError> {
        let query = CatalogQuery::new()
            .archived(true)
            .site(&tr.source)
            .logical_name_prefix(&tr.path);

        // Reduce matching file records to the ordered set of unique archive
        // uuids whose bundles hold them.
        let mut archive_uuids: Vec<String> = Vec::new();
        let mut start = 0;
        loop {
            let page = self
                .catalog
                .find_files(&query, &["uuid"], self.page_size, start)
                .await?;
            if page.is_empty() {
                break;
            }
            start += page.len();
            for stub in &page {
                let uuid = stub.get("uuid").and_then(|v| v.as_str()).ok_or_else(|| {
                    WorkError::protocol("File Catalog stub has no uuid".to_string())
                })?;
                let record = self.catalog.get_record(uuid).await?;
                self.reduce_archive_uuids(&record, &tr.source, &mut archive_uuids)?;
            }
        }
        if archive_uuids.is_empty() {
            return Err(WorkError::data_integrity(
                "File Catalog returned zero files for the TransferRequest",
            ));
        }
        info!(
            "found {} unique archive(s) covering {}:{}",
            archive_uuids.len(),
            tr.source,
            tr.path
        );

        // The archives are themselves catalogued; their records carry the
        // original bundle under the 'lta' key.
        for archive_uuid in &archive_uuids {
            let record = self.catalog.get_record(archive_uuid).await?;
            let spec = self.bundle_spec_from_archive(tr, &record)?;
            let uuids = self.db.bulk_create_bundles(vec![spec]).await?;
            debug!(
                "created Bundle {:?} for archive {archive_uuid}",
                uuids.first()
            );
        }
        Ok(())
    }

    /// Collect the unique archive uuids holding this record, preserving
    /// first-seen order.
    fn reduce_archive_uuids(
        &self,
        record: &serde_json::Value,
        source: &str,
        archive_uuids: &mut Vec<String>,
    ) -> Result<(), WorkError> {
        let locations = record
            .get("locations")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for location in &locations {
            let is_archive = location
                .get("archive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let at_source = location.get("site").and_then(|v| v.as_str()) == Some(source);
            if !(is_archive && at_source) {
                continue;
            }
            let path = location.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
                WorkError::protocol("archive location has no path".to_string())
            })?;
            let uuid = archive_uuid_from_location(path)
                .map_err(|e| WorkError::protocol(format!("{e:#}")))?;
            if !archive_uuids.contains(&uuid) {
                debug!("found unique archive uuid {uuid}");
                archive_uuids.push(uuid);
            }
        }
        Ok(())
    }

    fn bundle_spec_from_archive(
        &self,
        tr: &TransferRequest,
        record: &serde_json::Value,
    ) -> Result<BundleSpec, WorkError> {
        let projection = CatalogProjection::from_record(record)
            .map_err(|e| WorkError::protocol(format!("{e}")))?;
        let lta = record
            .get("lta")
            .ok_or_else(|| WorkError::protocol("archive record has no lta sub-document"))?;
        let bundle_path = lta
            .get("bundle_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WorkError::protocol("archive lta record has no bundle_path"))?;
        let checksum: Checksum = lta
            .get("checksum")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| WorkError::protocol(format!("malformed archive checksum: {e}")))?
            .ok_or_else(|| WorkError::protocol("archive lta record has no checksum"))?;
        Ok(BundleSpec {
            kind: "Bundle".to_string(),
            status: self.output_status,
            reason: String::new(),
            request: tr.uuid.clone(),
            source: tr.source.clone(),
            dest: tr.dest.clone(),
            path: tr.path.clone(),
            file_count: None,
            size: Some(projection.file_size),
            bundle_path: Some(bundle_path.to_string()),
            checksum: Some(checksum),
            catalog: Some(projection),
            claimed: false,
            verified: false,
        })
    }

    async fn quarantine(&self, tr: &TransferRequest, reason: &str) {
        error!("sending TransferRequest {} to quarantine: {reason}", tr.uuid);
        QUARANTINES
            .with_label_values(&["locator", "transfer_request"])
            .inc();
        let patch = TransferRequestPatch {
            original_status: Some(tr.status),
            status: Some(RequestStatus::Quarantined),
            reason: Some(quarantine_reason(&self.claimant, reason)),
            work_priority_timestamp: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self.db.patch_transfer_request(&tr.uuid, &patch).await {
            error!("unable to quarantine TransferRequest {}: {e}", tr.uuid);
        }
    }
}

#[async_trait]
impl Worker for Locator {
    fn component(&self) -> &'static str {
        "locator"
    }

    fn claimant(&self) -> &str {
        &self.claimant
    }

    async fn do_work_claim(&self) -> Result<WorkOutcome, WorkError> {
        let Some(tr) = self
            .db
            .pop_transfer_request(&self.source_site, &self.dest_site, &self.claimant)
            .await?
        else {
            info!("no TransferRequest to work on; going on vacation");
            return Ok(WorkOutcome::Nothing);
        };
        info!(
            "claimed TransferRequest {}: restore {} from {}",
            tr.uuid, tr.path, tr.source
        );
        match self.locate(&tr).await {
            Ok(()) => Ok(WorkOutcome::Processed),
            Err(e) => {
                self.quarantine(&tr, &e.reason).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn locator_for_tests() -> Locator {
        // Only the pure reduction logic is exercised here; the clients are
        // never called.
        let cancel = CancellationToken::new();
        let args = <LocatorArgs as clap::Parser>::try_parse_from([
            "lta",
            "--source-site",
            "NERSC",
            "--dest-site",
            "WIPAC",
            "--lta-rest-url",
            "https://lta.example.org/",
            "--lta-auth-openid-url",
            "https://keycloak.example.org/token",
            "--client-id",
            "lta-worker",
            "--client-secret",
            "hunter2",
            "--file-catalog-rest-url",
            "https://fc.example.org/",
            "--file-catalog-client-id",
            "fc-worker",
            "--file-catalog-client-secret",
            "hunter3",
        ])
        .unwrap();
        Locator::new(&args, &cancel).unwrap()
    }

    #[test]
    fn reduction_is_unique_and_ignores_foreign_locations() {
        let locator = locator_for_tests();
        let record = json!({
            "locations": [
                {"site": "WIPAC", "path": "/data/exp/f1.tar.gz"},
                {"site": "NERSC", "archive": true,
                 "path": "/archive/9a1cab0a395211eab1cbce3a3da73f88.zip:f1.tar.gz"},
                {"site": "DESY", "archive": true,
                 "path": "/other/ffffffffffffffffffffffffffffffff.zip:f1.tar.gz"},
            ]
        });
        let mut uuids = vec!["9a1cab0a395211eab1cbce3a3da73f88".to_string()];
        locator
            .reduce_archive_uuids(&record, "NERSC", &mut uuids)
            .unwrap();
        assert_eq!(uuids, vec!["9a1cab0a395211eab1cbce3a3da73f88".to_string()]);
    }

    #[test]
    fn bundle_spec_carries_the_archive_identity() {
        let locator = locator_for_tests();
        let tr = TransferRequest {
            uuid: "req-1".into(),
            source: "NERSC".into(),
            dest: "WIPAC".into(),
            path: "/data/exp/IceCube/2018".into(),
            status: RequestStatus::Ethereal,
            original_status: None,
            reason: String::new(),
            claimant: None,
            claimed: false,
            create_timestamp: None,
            update_timestamp: None,
            work_priority_timestamp: None,
        };
        let record = json!({
            "uuid": "9a1cab0a395211eab1cbce3a3da73f88",
            "logical_name": "/archive/9a1cab0a395211eab1cbce3a3da73f88.zip",
            "file_size": 98_765_432_100u64,
            "checksum": {"sha512": "feed"},
            "meta_modify_date": "2020-03-01 00:00:00",
            "lta": {
                "bundle_path": "/archive/9a1cab0a395211eab1cbce3a3da73f88.zip",
                "checksum": {"adler32": "0087af5a", "sha512": "feed"},
            },
        });
        let spec = locator.bundle_spec_from_archive(&tr, &record).unwrap();
        assert_eq!(spec.status, BundleStatus::Located);
        assert_eq!(spec.size, Some(98_765_432_100));
        assert_eq!(
            spec.bundle_path.as_deref(),
            Some("/archive/9a1cab0a395211eab1cbce3a3da73f88.zip")
        );
        assert_eq!(spec.checksum.as_ref().unwrap().sha512, "feed");
        assert_eq!(
            spec.catalog.as_ref().unwrap().uuid,
            "9a1cab0a395211eab1cbce3a3da73f88"
        );
        assert!(!spec.verified);
    }

    #[test]
    fn a_record_without_archive_locations_contributes_nothing() {
        let locator = locator_for_tests();
        let record = json!({
            "locations": [{"site": "WIPAC", "path": "/data/exp/f1.tar.gz"}]
        });
        let mut uuids = Vec::new();
        locator
            .reduce_archive_uuids(&record, "NERSC", &mut uuids)
            .unwrap();
        assert!(uuids.is_empty());
    }
}
