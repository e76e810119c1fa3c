//! Source-move verifier: proves the bytes at the destination match the
//! bytes that left the source by pulling the remote copy back and
//! re-checksumming it.

use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lta_api::models::{Bundle, BundlePatch, BundleStatus};

use crate::checksum::sha512sum;
use crate::config::VerifierArgs;
use crate::lta_db::LtaDbClient;
use crate::metrics::{CHECKSUM_MISMATCHES, QUARANTINES};
use crate::transfer::TransferBackend;
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Verifier {
    claimant: String,
    source_site: String,
    dest_site: String,
    input_status: BundleStatus,
    output_status: BundleStatus,
    workbox: Utf8PathBuf,
    transfer: crate::config::TransferArgs,
    db: Arc<LtaDbClient>,
    backend: Arc<dyn TransferBackend>,
}

impl Verifier {
    pub fn new(args: &VerifierArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let name = args.common.component_name.as_deref().unwrap_or("verifier");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            input_status: args.common.input_bundle_status(BundleStatus::Transferring)?,
            output_status: args.common.output_bundle_status(BundleStatus::Taping)?,
            workbox: args.workbox_path.clone(),
            transfer: args.transfer.clone(),
            db: args.common.lta_db_client(cancel)?,
            backend: args.transfer.backend()?,
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    async fn verify(&self, bundle: &Bundle) -> Result<(), WorkError> {
        let recorded = bundle
            .checksum
            .as_ref()
            .ok_or_else(|| WorkError::protocol("Bundle has no recorded checksum"))?;
        let bundle_path = bundle
            .bundle_path
            .as_deref()
            .ok_or_else(|| WorkError::protocol("Bundle has no bundle_path"))?;
        let basename = Utf8Path::new(bundle_path)
            .file_name()
            .ok_or_else(|| WorkError::protocol("bundle_path has no file name"))?;

        self.backend
            .refresh_credentials()
            .await
            .map_err(|e| WorkError::transient(format!("refreshing credentials: {e:#}")))?;

        let remote_url = self.transfer.dest_url_for(&bundle.path, basename);
        let scratch = self.workbox.join(basename);
        info!("copying {remote_url} to {scratch}");
        self.backend
            .fetch(&remote_url, &scratch)
            .await
            .map_err(|e| WorkError::resource(format!("fetching {remote_url}: {e:#}")))?;

        let computed = sha512sum(&scratch).await;
        // The scratch copy only lives long enough to hash.
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            warn!("could not remove scratch file {scratch}: {e}");
        }
        let computed = computed.map_err(|e| WorkError::resource(format!("{e:#}")))?;

        if computed != recorded.sha512 {
            info!("SHA512 at bundle creation:  {}", recorded.sha512);
            info!("SHA512 at the destination: {computed}");
            CHECKSUM_MISMATCHES.inc();
            return Err(WorkError::data_integrity(format!(
                "Checksum mismatch between creation and destination: {computed}"
            )));
        }

        info!("destination checksum matches bundle creation; the bundle is verified");
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
        Ok(())
    }

    async fn quarantine(&self, bundle: &Bundle, reason: &str) {
        error!("sending Bundle {} to quarantine: {reason}", bundle.uuid);
        QUARANTINES.with_label_values(&["verifier", "bundle"]).inc();
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
impl Worker for Verifier {
    fn component(&self) -> &'static str {
        "verifier"
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
            info!("no Bundle to verify; going on vacation");
            return Ok(WorkOutcome::Nothing);
        };
        info!("claimed Bundle {} at {}", bundle.uuid, bundle.status);
        match self.verify(&bundle).await {
            Ok(()) => Ok(WorkOutcome::Processed),
            Err(e) => {
                self.quarantine(&bundle, &e.reason).await;
                Err(e)
            }
        }
    }
}
