//! Picker: expands a TransferRequest at *ethereal* into size-balanced
//! Bundles at *specified*, plus the Metadata rows that pin down each
//! bundle's file set.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lta_api::models::{
    BundleSpec, BundleStatus, RequestStatus, TransferRequest, TransferRequestPatch,
};
use lta_api::METADATA_CHUNK_SIZE;

use crate::binpacking;
use crate::config::PickerArgs;
use crate::file_catalog::{CatalogQuery, FileCatalogClient};
use crate::lta_db::LtaDbClient;
use crate::metrics::QUARANTINES;
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Picker {
    claimant: String,
    source_site: String,
    dest_site: String,
    output_status: BundleStatus,
    ideal_bundle_size: u64,
    page_size: usize,
    db: Arc<LtaDbClient>,
    catalog: FileCatalogClient,
}

impl Picker {
    pub fn new(args: &PickerArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        if args.ideal_bundle_size <= 0 {
            bail!(
                "IDEAL_BUNDLE_SIZE must be positive, got {}",
                args.ideal_bundle_size
            );
        }
        let name = args.common.component_name.as_deref().unwrap_or("picker");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            output_status: args.common.output_bundle_status(BundleStatus::Specified)?,
            ideal_bundle_size: args.ideal_bundle_size as u64,
            page_size: args.file_catalog.file_catalog_page_size,
            db: args.common.lta_db_client(cancel)?,
            catalog: args.file_catalog.client(&args.common, cancel)?,
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    async fn expand(&self, tr: &TransferRequest) -> Result<(), WorkError> {
        let query = CatalogQuery::new()
            .site(&tr.source)
            .location_path_prefix(&tr.path)
            .logical_name_prefix(&tr.path);
        let stubs = self.catalog.find_all_stubs(&query, self.page_size).await?;
        if stubs.is_empty() {
            return Err(WorkError::data_integrity(
                "File Catalog returned zero files for the TransferRequest",
            ));
        }
        info!(
            "File Catalog matched {} file(s) under {}:{}",
            stubs.len(),
            tr.source,
            tr.path
        );

        let bins = binpacking::pack(stubs, self.ideal_bundle_size);
        info!("Creating {} new Bundles in the LTA DB.", bins.len());
        for bin in bins {
            let file_count = bin.len() as u64;
            let spec = BundleSpec {
                kind: "Bundle".to_string(),
                status: self.output_status,
                reason: String::new(),
                request: tr.uuid.clone(),
                source: tr.source.clone(),
                dest: tr.dest.clone(),
                path: tr.path.clone(),
                file_count: Some(file_count),
                size: None,
                bundle_path: None,
                checksum: None,
                catalog: None,
                claimed: false,
                verified: false,
            };
            let uuids = self.db.bulk_create_bundles(vec![spec]).await?;
            let bundle_uuid = uuids
                .first()
                .ok_or_else(|| WorkError::protocol("bulk_create returned no bundle uuid"))?;
            info!("new Bundle {bundle_uuid} holds {file_count} file(s)");
            for chunk in bin.chunks(METADATA_CHUNK_SIZE) {
                let files: Vec<String> = chunk.iter().map(|f| f.uuid.clone()).collect();
                let count = self.db.bulk_create_metadata(bundle_uuid, files).await?;
                debug!("created {count} Metadata rows for bundle {bundle_uuid}");
            }
        }

        // Single-shot transition out of *ethereal*: a retried pop can never
        // re-expand this request.
        self.db
            .patch_transfer_request(
                &tr.uuid,
                &TransferRequestPatch {
                    status: Some(RequestStatus::Specified),
                    reason: Some(String::new()),
                    claimant: Some(String::new()),
                    claimed: Some(false),
                    update_timestamp: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn quarantine(&self, tr: &TransferRequest, reason: &str) {
        error!("sending TransferRequest {} to quarantine: {reason}", tr.uuid);
        QUARANTINES
            .with_label_values(&["picker", "transfer_request"])
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
impl Worker for Picker {
    fn component(&self) -> &'static str {
        "picker"
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
            "claimed TransferRequest {}: {} -> {} for {}",
            tr.uuid, tr.source, tr.dest, tr.path
        );
        match self.expand(&tr).await {
            Ok(()) => Ok(WorkOutcome::Processed),
            Err(e) => {
                // Bundles already created stay at *specified*: each one's
                // file set is complete per bin and safe for the Bundler.
                self.quarantine(&tr, &e.reason).await;
                Err(e)
            }
        }
    }
}
