//! Cataloger (site verifier): records a taped archive and its constituents
//! in the File Catalog at the destination site, completing the bundle.

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8Path;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lta_api::models::{Bundle, BundlePatch, BundleStatus, CatalogLocation};
use lta_api::METADATA_CHUNK_SIZE;

use crate::config::CatalogerArgs;
use crate::file_catalog::FileCatalogClient;
use crate::lta_db::LtaDbClient;
use crate::metrics::QUARANTINES;
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Cataloger {
    claimant: String,
    source_site: String,
    dest_site: String,
    input_status: BundleStatus,
    output_status: BundleStatus,
    transfer: crate::config::TransferArgs,
    db: Arc<LtaDbClient>,
    catalog: FileCatalogClient,
}

impl Cataloger {
    pub fn new(args: &CatalogerArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let name = args.common.component_name.as_deref().unwrap_or("cataloger");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            input_status: args.common.input_bundle_status(BundleStatus::Taping)?,
            output_status: args.common.output_bundle_status(BundleStatus::Completed)?,
            transfer: args.transfer.clone(),
            db: args.common.lta_db_client(cancel)?,
            catalog: args.file_catalog.client(&args.common, cancel)?,
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    async fn record(&self, bundle: &Bundle) -> Result<(), WorkError> {
        let checksum = bundle
            .checksum
            .as_ref()
            .ok_or_else(|| WorkError::protocol("Bundle has no recorded checksum"))?;
        let size = bundle
            .size
            .ok_or_else(|| WorkError::protocol("Bundle has no recorded size"))?;
        let bundle_path = bundle
            .bundle_path
            .as_deref()
            .ok_or_else(|| WorkError::protocol("Bundle has no bundle_path"))?;
        let basename = Utf8Path::new(bundle_path)
            .file_name()
            .ok_or_else(|| WorkError::protocol("bundle_path has no file name"))?;

        // The archive's own catalog record, at its destination path. The
        // full bundle record rides along under the application-private
        // 'lta' key; the Locator reads it back on restore.
        let archive_path = self
            .transfer
            .dest_url_for(&bundle.path, basename)
            .path()
            .to_string();
        let archive_record = json!({
            "uuid": bundle.uuid,
            "logical_name": archive_path,
            "checksum": checksum,
            "file_size": size,
            "locations": [{
                "site": bundle.dest,
                "path": archive_path,
                "archive": true,
            }],
            "lta": bundle,
        });
        self.catalog.create_record(&archive_record).await?;
        info!("catalogued archive {} at {archive_path}", bundle.uuid);

        // Every constituent file gains a destination location inside the
        // archive. Locations already present are left alone, so a re-run
        // after a crash converges instead of duplicating.
        let mut skip = 0;
        let mut count: u64 = 0;
        loop {
            let page = self
                .db
                .metadata_page(&bundle.uuid, METADATA_CHUNK_SIZE, skip)
                .await?;
            if page.is_empty() {
                break;
            }
            skip += page.len();
            for record in &page {
                let catalog_record = self.catalog.get_record(&record.file_catalog_uuid).await?;
                let logical_name = catalog_record
                    .get("logical_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        WorkError::protocol(format!(
                            "File Catalog record {} has no logical_name",
                            record.file_catalog_uuid
                        ))
                    })?;
                let location = CatalogLocation {
                    site: bundle.dest.clone(),
                    path: format!("{archive_path}:{logical_name}"),
                    archive: Some(true),
                };
                self.catalog
                    .add_location(&record.file_catalog_uuid, &location)
                    .await?;
                count += 1;
            }
            debug!("catalogued {count} constituent file(s) so far");
        }
        if count != bundle.file_count {
            return Err(WorkError::data_integrity(format!(
                "Expected {} Metadata records, but only processed {count} records.",
                bundle.file_count
            )));
        }

        self.db
            .patch_bundle(
                &bundle.uuid,
                &BundlePatch {
                    status: Some(self.output_status),
                    reason: Some(String::new()),
                    update_timestamp: Some(Utc::now()),
                    verified: Some(true),
                    claimed: Some(false),
                    claimant: Some(String::new()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn quarantine(&self, bundle: &Bundle, reason: &str) {
        error!("sending Bundle {} to quarantine: {reason}", bundle.uuid);
        QUARANTINES
            .with_label_values(&["cataloger", "bundle"])
            .inc();
        let patch = BundlePatch {
            original_status: Some(bundle.status),
            status: Some(BundleStatus::Quarantined),
            reason: Some(quarantine_reason(&self.claimant, reason)),
            work_priority_timestamp: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self.db.patch_bundle(&bundle.uuid, &patch).await {
            error!("unable to quarantine Bundle {}: {e}", bundle.uuid);
        }
    }
}

#[async_trait]
impl Worker for Cataloger {
    fn component(&self) -> &'static str {
        "cataloger"
    }

    fn claimant(&self) -> &str {
        &self.claimant
    }

    async fn do_work_claim(&self) -> Result<WorkOutcome, WorkError> {
        let Some(bundle) = self
            .db
            .pop_bundle(
                &self.source_site,
                &self.dest_site,
                self.input_status,
                &self.claimant,
            )
            .await?
        else {
            info!("no Bundle to catalog; going on vacation");
            return Ok(WorkOutcome::Nothing);
        };
        info!("claimed Bundle {} at {}", bundle.uuid, bundle.status);
        match self.record(&bundle).await {
            Ok(()) => Ok(WorkOutcome::Processed),
            Err(e) => {
                self.quarantine(&bundle, &e.reason).await;
                Err(e)
            }
        }
    }
}
