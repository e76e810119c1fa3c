//! Replicator: submits a finished archive to the transfer backend and polls
//! the task to a terminal state.

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8Path;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lta_api::models::{Bundle, BundlePatch, BundleStatus};

use crate::config::ReplicatorArgs;
use crate::lta_db::LtaDbClient;
use crate::metrics::{QUARANTINES, TRANSFERS};
use crate::transfer::{wait_for_transfer, TransferBackend, TransferTaskStatus, WaitResult};
use crate::worker::{new_claimant, quarantine_reason, WorkError, WorkOutcome, Worker};

pub struct Replicator {
    claimant: String,
    source_site: String,
    dest_site: String,
    input_status: BundleStatus,
    output_status: BundleStatus,
    transfer: crate::config::TransferArgs,
    db: Arc<LtaDbClient>,
    backend: Arc<dyn TransferBackend>,
    cancel: CancellationToken,
}

impl Replicator {
    pub fn new(args: &ReplicatorArgs, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let name = args.common.component_name.as_deref().unwrap_or("replicator");
        Ok(Self {
            claimant: new_claimant(name),
            source_site: args.common.source_site.clone(),
            dest_site: args.common.dest_site.clone(),
            input_status: args.common.input_bundle_status(BundleStatus::Created)?,
            output_status: args.common.output_bundle_status(BundleStatus::Transferring)?,
            transfer: args.transfer.clone(),
            db: args.common.lta_db_client(cancel)?,
            backend: args.transfer.backend()?,
            cancel: cancel.clone(),
        })
    }

    pub fn db(&self) -> Arc<LtaDbClient> {
        self.db.clone()
    }

    async fn replicate(&self, bundle: &Bundle) -> Result<(), WorkError> {
        let bundle_path = bundle
            .bundle_path
            .as_deref()
            .ok_or_else(|| WorkError::protocol("Bundle has no bundle_path"))?;
        let bundle_path = Utf8Path::new(bundle_path);
        let basename = bundle_path
            .file_name()
            .ok_or_else(|| WorkError::protocol("bundle_path has no file name"))?;

        let dest_url = self.transfer.dest_url_for(&bundle.path, basename);
        let task_id = self
            .backend
            .submit(bundle_path, &dest_url)
            .await
            .map_err(|e| WorkError::resource(format!("submitting transfer: {e:#}")))?;
        let reference = format!("{}/{}", self.backend.scheme(), task_id);
        info!("transfer submitted: {reference} -> {dest_url}");

        self.db
            .patch_bundle(
                &bundle.uuid,
                &BundlePatch {
                    transfer_reference: Some(reference.clone()),
                    update_timestamp: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        let result = wait_for_transfer(
            self.backend.as_ref(),
            &task_id,
            self.transfer.poll_interval(),
            self.transfer.deadline(),
            &self.cancel,
        )
        .await
        .map_err(|e| WorkError::transient(format!("polling transfer {reference}: {e:#}")))?;

        match result {
            WaitResult::Terminal(TransferTaskStatus::Succeeded) => {
                TRANSFERS.with_label_values(&["succeeded"]).inc();
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
            WaitResult::Terminal(status) => {
                TRANSFERS.with_label_values(&["failed"]).inc();
                Err(WorkError::resource(format!(
                    "transfer {reference} ended with status {status}"
                )))
            }
            WaitResult::TimedOut => {
                TRANSFERS.with_label_values(&["timed_out"]).inc();
                if let Err(e) = self.backend.cancel(&task_id).await {
                    warn!("could not cancel transfer {reference}: {e:#}");
                }
                Err(WorkError::resource(format!("transfer {reference} timed out")))
            }
            WaitResult::Cancelled => Err(WorkError::transient("shutting down mid-transfer")),
        }
    }

    async fn quarantine(&self, bundle: &Bundle, reason: &str) {
        error!("sending Bundle {} to quarantine: {reason}", bundle.uuid);
        QUARANTINES
            .with_label_values(&["replicator", "bundle"])
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
impl Worker for Replicator {
    fn component(&self) -> &'static str {
        "replicator"
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
            info!("no Bundle to transfer; going on vacation");
            return Ok(WorkOutcome::Nothing);
        };
        info!("claimed Bundle {} at {}", bundle.uuid, bundle.status);
        match self.replicate(&bundle).await {
            Ok(()) => Ok(WorkOutcome::Processed),
            Err(_) if self.cancel.is_cancelled() => {
                // Shutting down mid-transfer. The bundle is healthy and the
                // submitted task may still succeed; leave the row claimed
                // for whoever re-claims it after the lease expires.
                info!(
                    "shutting down; leaving Bundle {} for the next replica",
                    bundle.uuid
                );
                Ok(WorkOutcome::Nothing)
            }
            Err(e) => {
                self.quarantine(&bundle, &e.reason).await;
                Err(e)
            }
        }
    }
}
