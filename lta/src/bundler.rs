//! Bundler: materializes a Bundle's files into one ZIP64 archive on the
//! outbox filesystem, with a manifest sidecar as the first entry and the
//! checksum pair recorded on the Bundle.

use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lta_api::models::{Bundle, BundlePatch, BundleStatus, ManifestHeader};
use lta_api::{MANIFEST_VERSION, METADATA_CHUNK_SIZE};

use crate::archive::ArchiveWriter;
use crate::checksum::lta_checksums;
use crate::config::BundlerArgs;
use crate::file_catalog::FileCatalogClient;
use crate::lta_db::LtaDbClient;
use crate::metrics::{BUNDLES_ARCHIVED, BYTES_BUNDLED, QUARANTINES};
use crate::pathutil::relative_entry_path;
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Bundler {
    claimant: String,
    source_site: String,
    dest_site: String,
    input_status: BundleStatus,
    output_status: BundleStatus,
    workbox: Utf8PathBuf,
    outbox: Utf8PathBuf,
    db: Arc<LtaDbClient>,
    catalog: FileCatalogClient,
}

impl Bundler {
    pub fn new(args: &BundlerArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let name = args.common.component_name.as_deref().unwrap_or("bundler");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            input_status: args.common.input_bundle_status(BundleStatus::Specified)?,
            output_status: args.common.output_bundle_status(BundleStatus::Created)?,
            workbox: args.bundler_workbox_path.clone(),
            outbox: args.bundler_outbox_path.clone(),
            db: args.common.lta_db_client(cancel)?,
            catalog: args.file_catalog.client(&args.common, cancel)?,
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    async fn build(&self, bundle: &Bundle) -> Result<(), WorkError> {
        let zip_name = format!("{}.zip", bundle.uuid);
        let sidecar_name = format!("{}.metadata.ndjson", bundle.uuid);
        let zip_path = self.workbox.join(&zip_name);
        let sidecar_path = self.workbox.join(&sidecar_name);
        info!(
            "bundling {} file(s) from '{}' to '{}' as '{zip_name}'",
            bundle.file_count, bundle.source, bundle.dest
        );

        // A previous replica may have crashed mid-build; its partial
        // artifacts are stale and rebuilt from scratch.
        remove_stale(&zip_path).await?;
        remove_stale(&sidecar_path).await?;

        let manifest_count = self.write_manifest(bundle, &sidecar_path).await?;
        check_file_count("metadata file", manifest_count, bundle.file_count)?;

        let archived_count = self
            .write_archive(bundle, &zip_path, &sidecar_path, &sidecar_name)
            .await?;
        check_file_count("bundle archive file", archived_count, bundle.file_count)?;

        let checksum = lta_checksums(&zip_path)
            .await
            .map_err(|e| WorkError::resource(format!("{e:#}")))?;
        let size = tokio::fs::metadata(&zip_path)
            .await
            .map_err(|e| WorkError::resource(format!("sizing {zip_path}: {e}")))?
            .len();
        info!(
            "archive is {size} bytes, adler32 {}, sha512 {}",
            checksum.adler32, checksum.sha512
        );

        let final_path = if self.outbox != self.workbox {
            let final_path = self.outbox.join(&zip_name);
            tokio::fs::rename(&zip_path, &final_path)
                .await
                .map_err(|e| {
                    WorkError::resource(format!("moving {zip_path} to {final_path}: {e}"))
                })?;
            final_path
        } else {
            zip_path
        };
        tokio::fs::remove_file(&sidecar_path)
            .await
            .map_err(|e| WorkError::resource(format!("removing {sidecar_path}: {e}")))?;
        info!("finished archive is at '{final_path}'");

        self.db
            .patch_bundle(
                &bundle.uuid,
                &BundlePatch {
                    status: Some(self.output_status),
                    reason: Some(String::new()),
                    update_timestamp: Some(Utc::now()),
                    bundle_path: Some(final_path.to_string()),
                    size: Some(size),
                    checksum: Some(checksum),
                    verified: Some(false),
                    claimed: Some(false),
                    claimant: Some(String::new()),
                    ..Default::default()
                },
            )
            .await?;
        BUNDLES_ARCHIVED.inc();
        BYTES_BUNDLED.inc_by(size);
        Ok(())
    }

    /// Write the `<uuid>.metadata.ndjson` sidecar: one header line, then
    /// the full File Catalog record of every member file, in Metadata-row
    /// order. Returns the number of file records written.
    async fn write_manifest(
        &self,
        bundle: &Bundle,
        sidecar_path: &Utf8Path,
    ) -> Result<u64, WorkError> {
        let header = ManifestHeader {
            uuid: bundle.uuid.clone(),
            component: "bundler".to_string(),
            version: MANIFEST_VERSION,
            create_timestamp: Utc::now(),
            file_count: bundle.file_count,
        };
        let mut file = tokio::fs::File::create(sidecar_path)
            .await
            .map_err(|e| WorkError::resource(format!("creating {sidecar_path}: {e}")))?;
        write_ndjson_line(&mut file, &header, sidecar_path).await?;

        let mut count: u64 = 0;
        let mut skip = 0;
        loop {
            let page = self
                .db
                .metadata_page(&bundle.uuid, METADATA_CHUNK_SIZE, skip)
                .await?;
            if page.is_empty() {
                break;
            }
            debug!("LTA DB returned {} Metadata record(s) to process", page.len());
            skip += page.len();
            for record in &page {
                let catalog_record = self.catalog.get_record(&record.file_catalog_uuid).await?;
                write_ndjson_line(&mut file, &catalog_record, sidecar_path).await?;
                count += 1;
            }
        }
        file.flush()
            .await
            .map_err(|e| WorkError::resource(format!("flushing {sidecar_path}: {e}")))?;
        Ok(count)
    }

    /// Stream every member file into the archive, sidecar first. Returns
    /// the number of member files written (the sidecar not counted).
    async fn write_archive(
        &self,
        bundle: &Bundle,
        zip_path: &Utf8Path,
        sidecar_path: &Utf8Path,
        sidecar_name: &str,
    ) -> Result<u64, WorkError> {
        let request_path = Utf8Path::new(&bundle.path);
        let mut writer = ArchiveWriter::create(zip_path)
            .await
            .map_err(|e| WorkError::resource(format!("{e:#}")))?;
        writer
            .add_file(sidecar_path, sidecar_name)
            .await
            .map_err(|e| WorkError::resource(format!("{e:#}")))?;

        let mut count: u64 = 0;
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
                let logical_name = catalog_record
                    .get("logical_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        WorkError::protocol(format!(
                            "File Catalog record {} has no logical_name",
                            record.file_catalog_uuid
                        ))
                    })?;
                let entry = relative_entry_path(Utf8Path::new(logical_name), request_path)
                    .map_err(|e| WorkError::data_integrity(format!("{e:#}")))?;
                count += 1;
                debug!("writing file {count}: '{logical_name}' into '{zip_path}'");
                writer
                    .add_file(Utf8Path::new(logical_name), entry.as_str())
                    .await
                    .map_err(|e| WorkError::resource(format!("{e:#}")))?;
            }
        }
        writer
            .finish()
            .await
            .map_err(|e| WorkError::resource(format!("{e:#}")))?;
        Ok(count)
    }

    async fn quarantine(&self, bundle: &Bundle, reason: &str) {
        error!("sending Bundle {} to quarantine: {reason}", bundle.uuid);
        QUARANTINES.with_label_values(&["bundler", "bundle"]).inc();
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

fn check_file_count(what: &str, processed: u64, expected: u64) -> Result<(), WorkError> {
    if processed == expected {
        Ok(())
    } else {
        Err(WorkError::data_integrity(format!(
            "Bad mojo creating {what}. Expected {expected} Metadata records, \
             but only processed {processed} records."
        )))
    }
}

async fn remove_stale(path: &Utf8Path) -> Result<(), WorkError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!("removed stale '{path}' from a previous attempt");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkError::resource(format!("removing stale {path}: {e}"))),
    }
}

async fn write_ndjson_line<T: serde::Serialize>(
    file: &mut tokio::fs::File,
    value: &T,
    path: &Utf8Path,
) -> Result<(), WorkError> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| WorkError::protocol(format!("serializing manifest line: {e}")))?;
    line.push(b'\n');
    file.write_all(&line)
        .await
        .map_err(|e| WorkError::resource(format!("writing {path}: {e}")))
}

#[async_trait]
impl Worker for Bundler {
    fn component(&self) -> &'static str {
        "bundler"
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
            info!("no Bundle to build; going on vacation");
            return Ok(WorkOutcome::Nothing);
        };
        info!("claimed Bundle {} at {}", bundle.uuid, bundle.status);
        match self.build(&bundle).await {
            Ok(()) => Ok(WorkOutcome::Processed),
            Err(e) => {
                // The sidecar and any partial archive are left in place for
                // operator inspection; a retry overwrites them.
                self.quarantine(&bundle, &e.reason).await;
                Err(e)
            }
        }
    }
}
