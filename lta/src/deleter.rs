//! Deleter: removes warehouse files whose Bundle reached *completed*.
//!
//! Deletion is the only irreversible side effect in the pipeline, so it is
//! double-gated: every constituent file must carry an archive location at
//! the destination site, and the lease is re-confirmed against the LTA DB
//! immediately before the first unlink.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lta_api::models::{Bundle, BundlePatch, BundleStatus, CatalogLocation};
use lta_api::METADATA_CHUNK_SIZE;

use crate::config::DeleterArgs;
use crate::file_catalog::FileCatalogClient;
use crate::lta_db::LtaDbClient;
use crate::metrics::{FILES_DELETED, QUARANTINES};
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Deleter {
    claimant: String,
    source_site: String,
    dest_site: String,
    input_status: BundleStatus,
    output_status: BundleStatus,
    db: Arc<LtaDbClient>,
    catalog: FileCatalogClient,
}

impl Deleter {
    pub fn new(args: &DeleterArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let name = args.common.component_name.as_deref().unwrap_or("deleter");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            input_status: args.common.input_bundle_status(BundleStatus::Completed)?,
            output_status: args.common.output_bundle_status(BundleStatus::Deleted)?,
            db: args.common.lta_db_client(cancel)?,
            catalog: args.file_catalog.client(&args.common, cancel)?,
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    /// Gather the warehouse paths of a bundle's files, insisting that each
    /// one is archived at the destination site.
    async fn collect_paths(&self, bundle: &Bundle) -> Result<Vec<String>, WorkError> {
        let mut paths = Vec::with_capacity(bundle.file_count as usize);
        let mut skip = 0;
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
                let locations: Vec<CatalogLocation> = catalog_record
                    .get("locations")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| WorkError::protocol(format!("malformed locations: {e}")))?
                    .unwrap_or_default();
                let archived_at_dest = locations
                    .iter()
                    .any(|l| l.site == bundle.dest && l.archive == Some(true));
                if !archived_at_dest {
                    return Err(WorkError::data_integrity(format!(
                        "File {} has no archive location at {}",
                        record.file_catalog_uuid, bundle.dest
                    )));
                }
                let logical_name = catalog_record
                    .get("logical_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        WorkError::protocol(format!(
                            "File Catalog record {} has no logical_name",
                            record.file_catalog_uuid
                        ))
                    })?;
                paths.push(logical_name.to_string());
            }
        }
        Ok(paths)
    }

    async fn delete(&self, bundle: &Bundle) -> Result<WorkOutcome, WorkError> {
        let paths = self.collect_paths(bundle).await?;
        debug!("{} warehouse file(s) are cleared for deletion", paths.len());

        // The archive check above took time; someone may have broken our
        // lease meanwhile. Re-confirm before touching the warehouse.
        if !self
            .db
            .confirm_bundle_claim(&bundle.uuid, &self.claimant)
            .await?
        {
            warn!(
                "lost the lease on Bundle {} before deleting; leaving it to the new claimant",
                bundle.uuid
            );
            return Ok(WorkOutcome::Processed);
        }

        let mut failures = Vec::new();
        for path in &paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    FILES_DELETED.inc();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // A crashed predecessor already removed it.
                    debug!("warehouse file {path} was already gone");
                }
                Err(e) => {
                    error!("unable to delete warehouse file {path}: {e}");
                    failures.push(format!("{path}: {e}"));
                }
            }
        }
        if !failures.is_empty() {
            return Err(WorkError::resource(format!(
                "failed to delete {} warehouse file(s): {}",
                failures.len(),
                failures.join("; ")
            )));
        }
        info!(
            "deleted {} warehouse file(s) for Bundle {}",
            paths.len(),
            bundle.uuid
        );

        self.db
            .patch_bundle(
                &bundle.uuid,
                &BundlePatch {
                    status: Some(self.output_status),
                    reason: Some(String::new()),
                    update_timestamp: Some(Utc::now()),
                    claimed: Some(false),
                    claimant: Some(String::new()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(WorkOutcome::Processed)
    }

    async fn quarantine(&self, bundle: &Bundle, reason: &str) {
        error!("sending Bundle {} to quarantine: {reason}", bundle.uuid);
        QUARANTINES.with_label_values(&["deleter", "bundle"]).inc();
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
impl Worker for Deleter {
    fn component(&self) -> &'static str {
        "deleter"
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
            info!("no Bundle ready for deletion; going on vacation");
            return Ok(WorkOutcome::Nothing);
        };
        info!("claimed Bundle {} at {}", bundle.uuid, bundle.status);
        match self.delete(&bundle).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.quarantine(&bundle, &e.reason).await;
                Err(e)
            }
        }
    }
}
