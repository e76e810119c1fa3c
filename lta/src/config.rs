//! Structured per-component configuration.
//!
//! Every recognized key is both a flag and an environment variable; missing
//! required keys fail argument parsing at start-up with a clear error,
//! before any record is touched. Components validate the parsed values in
//! their constructors.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::ArgAction;
use tokio_util::sync::CancellationToken;
use url::Url;

use lta_api::models::BundleStatus;

use crate::auth::TokenProvider;
use crate::file_catalog::FileCatalogClient;
use crate::logging::LogFormat;
use crate::lta_db::LtaDbClient;
use crate::transfer::{make_backend, BackendKind, TransferBackend};
use crate::worker::LoopPolicy;

/// Configuration shared by every component.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Name used as the claimant prefix; defaults to the component name.
    #[arg(long, env = "COMPONENT_NAME")]
    pub component_name: Option<String>,

    /// Site whose records this replica pops.
    #[arg(long, env = "SOURCE_SITE")]
    pub source_site: String,

    /// Destination site whose records this replica pops.
    #[arg(long, env = "DEST_SITE")]
    pub dest_site: String,

    /// Override the status this component consumes.
    #[arg(long, env = "INPUT_STATUS")]
    pub input_status: Option<String>,

    /// Override the status this component produces.
    #[arg(long, env = "OUTPUT_STATUS")]
    pub output_status: Option<String>,

    /// Base URL of the LTA DB REST service.
    #[arg(long, env = "LTA_REST_URL")]
    pub lta_rest_url: Url,

    /// OIDC token endpoint for client-credentials grants.
    #[arg(long, env = "LTA_AUTH_OPENID_URL")]
    pub lta_auth_openid_url: Url,

    /// Client id for the LTA DB.
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: String,

    /// Client secret for the LTA DB.
    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// Retries per LTA DB / File Catalog request.
    #[arg(long, env = "WORK_RETRIES", default_value_t = 3)]
    pub work_retries: u32,

    /// Timeout per outbound request, in seconds.
    #[arg(long, env = "WORK_TIMEOUT_SECONDS", default_value_t = 30)]
    pub work_timeout_seconds: u64,

    /// Sleep between work cycles once the queue drains, in seconds.
    #[arg(long, env = "WORK_SLEEP_DURATION_SECONDS", default_value_t = 60)]
    pub work_sleep_duration_seconds: u64,

    /// Exit after one work cycle.
    #[arg(long, env = "RUN_ONCE_AND_DIE", action = ArgAction::Set, default_value = "false")]
    pub run_once_and_die: bool,

    /// Exit on the first empty pop.
    #[arg(long, env = "RUN_UNTIL_NO_WORK", action = ArgAction::Set, default_value = "false")]
    pub run_until_no_work: bool,

    /// Seconds between heartbeat reports; 0 disables the heartbeat.
    #[arg(long, env = "HEARTBEAT_SLEEP_DURATION_SECONDS", default_value_t = 60)]
    pub heartbeat_sleep_duration_seconds: u64,

    /// Port for the Prometheus /metrics endpoint; unset disables it.
    #[arg(long, env = "PROMETHEUS_METRICS_PORT")]
    pub prometheus_metrics_port: Option<u16>,

    /// Default log filter, overridable per target via RUST_LOG.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "plain")]
    pub log_format: LogFormat,
}

impl CommonArgs {
    pub fn work_timeout(&self) -> Duration {
        Duration::from_secs(self.work_timeout_seconds)
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        LoopPolicy {
            sleep: Duration::from_secs(self.work_sleep_duration_seconds),
            run_once_and_die: self.run_once_and_die,
            run_until_no_work: self.run_until_no_work,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_sleep_duration_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    /// Status consumed by this component: the override if set, else the
    /// component default.
    pub fn input_bundle_status(&self, default: BundleStatus) -> anyhow::Result<BundleStatus> {
        parse_status_override(self.input_status.as_deref(), default)
    }

    pub fn output_bundle_status(&self, default: BundleStatus) -> anyhow::Result<BundleStatus> {
        parse_status_override(self.output_status.as_deref(), default)
    }

    pub fn lta_db_client(&self, cancel: &CancellationToken) -> anyhow::Result<Arc<LtaDbClient>> {
        let tokens = Arc::new(TokenProvider::new(
            reqwest::Client::builder()
                .timeout(self.work_timeout())
                .build()?,
            self.lta_auth_openid_url.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
        ));
        Ok(Arc::new(LtaDbClient::new(
            &self.lta_rest_url,
            tokens,
            self.work_timeout(),
            self.work_retries,
            cancel.clone(),
        )?))
    }
}

fn parse_status_override(
    value: Option<&str>,
    default: BundleStatus,
) -> anyhow::Result<BundleStatus> {
    match value {
        None => Ok(default),
        Some(raw) => {
            BundleStatus::from_str(raw).with_context(|| format!("unknown bundle status '{raw}'"))
        }
    }
}

/// File Catalog access, for the components that talk to it.
#[derive(clap::Args, Debug, Clone)]
pub struct FileCatalogArgs {
    /// Base URL of the File Catalog REST service.
    #[arg(long, env = "FILE_CATALOG_REST_URL")]
    pub file_catalog_rest_url: Url,

    /// Client id for the File Catalog.
    #[arg(long, env = "FILE_CATALOG_CLIENT_ID")]
    pub file_catalog_client_id: String,

    /// Client secret for the File Catalog.
    #[arg(long, env = "FILE_CATALOG_CLIENT_SECRET", hide_env_values = true)]
    pub file_catalog_client_secret: String,

    /// Page size for File Catalog queries.
    #[arg(long, env = "FILE_CATALOG_PAGE_SIZE", default_value_t = lta_api::DEFAULT_FILE_CATALOG_PAGE_SIZE)]
    pub file_catalog_page_size: usize,
}

impl FileCatalogArgs {
    pub fn client(
        &self,
        common: &CommonArgs,
        cancel: &CancellationToken,
    ) -> anyhow::Result<FileCatalogClient> {
        let tokens = Arc::new(TokenProvider::new(
            reqwest::Client::builder()
                .timeout(common.work_timeout())
                .build()?,
            common.lta_auth_openid_url.clone(),
            self.file_catalog_client_id.clone(),
            self.file_catalog_client_secret.clone(),
        ));
        FileCatalogClient::new(
            &self.file_catalog_rest_url,
            tokens,
            common.work_timeout(),
            common.work_retries,
            cancel.clone(),
        )
    }
}

/// Transfer backend selection and destination layout.
#[derive(clap::Args, Debug, Clone)]
pub struct TransferArgs {
    /// Which transfer driver moves the bytes.
    #[arg(long, env = "TRANSFER_BACKEND", value_enum, default_value = "fts")]
    pub transfer_backend: BackendKind,

    /// REST endpoint of the grid transfer service (fts backend).
    #[arg(long, env = "TRANSFER_REST_URL")]
    pub transfer_rest_url: Option<Url>,

    /// URL root under which source paths are visible to the transfer
    /// service (fts backend).
    #[arg(long, env = "TRANSFER_SOURCE_URL")]
    pub transfer_source_url: Option<Url>,

    /// URL root of the destination site.
    #[arg(long, env = "TRANSFER_DEST_URL")]
    pub transfer_dest_url: Url,

    /// Seconds between transfer status polls.
    #[arg(long, env = "TRANSFER_POLL_SECONDS", default_value_t = 10)]
    pub transfer_poll_seconds: u64,

    /// Deadline for one transfer, in seconds.
    #[arg(long, env = "TRANSFER_TIMEOUT_SECONDS", default_value_t = 1200)]
    pub transfer_timeout_seconds: u64,

    /// Mirror the request path under the destination root instead of
    /// placing archives flat.
    #[arg(long, env = "USE_FULL_BUNDLE_PATH", action = ArgAction::Set, default_value = "false")]
    pub use_full_bundle_path: bool,
}

impl TransferArgs {
    pub fn backend(&self) -> anyhow::Result<Arc<dyn TransferBackend>> {
        make_backend(
            self.transfer_backend,
            self.transfer_rest_url.as_ref(),
            self.transfer_source_url.as_ref(),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.transfer_poll_seconds)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_seconds)
    }

    /// Where a bundle archive lives at the destination site.
    pub fn dest_url_for(&self, request_path: &str, basename: &str) -> Url {
        if self.use_full_bundle_path {
            crate::pathutil::join_url(&self.transfer_dest_url, &[request_path, basename])
        } else {
            crate::pathutil::join_url(&self.transfer_dest_url, &[basename])
        }
    }
}

#[derive(clap::Parser, Debug, Clone)]
pub struct PickerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub file_catalog: FileCatalogArgs,

    /// Target bundle size in bytes.
    #[arg(long, env = "IDEAL_BUNDLE_SIZE", default_value_t = lta_api::DEFAULT_IDEAL_BUNDLE_SIZE as i64)]
    pub ideal_bundle_size: i64,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct BundlerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub file_catalog: FileCatalogArgs,

    /// Where archives are built.
    #[arg(long, env = "BUNDLER_WORKBOX_PATH")]
    pub bundler_workbox_path: Utf8PathBuf,

    /// Where finished archives are staged for the replicator.
    #[arg(long, env = "BUNDLER_OUTBOX_PATH")]
    pub bundler_outbox_path: Utf8PathBuf,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct ReplicatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct VerifierArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Scratch space for destination copies being re-checksummed.
    #[arg(long, env = "WORKBOX_PATH")]
    pub workbox_path: Utf8PathBuf,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct CatalogerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub file_catalog: FileCatalogArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct DeleterArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub file_catalog: FileCatalogArgs,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct LocatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub file_catalog: FileCatalogArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn base_flags() -> Vec<&'static str> {
        vec![
            "lta",
            "--source-site",
            "WIPAC",
            "--dest-site",
            "NERSC",
            "--lta-rest-url",
            "https://lta.example.org/",
            "--lta-auth-openid-url",
            "https://keycloak.example.org/token",
            "--client-id",
            "lta-worker",
            "--client-secret",
            "hunter2",
        ]
    }

    fn fc_flags() -> Vec<&'static str> {
        vec![
            "--file-catalog-rest-url",
            "https://fc.example.org/",
            "--file-catalog-client-id",
            "fc-worker",
            "--file-catalog-client-secret",
            "hunter3",
        ]
    }

    #[test]
    fn picker_args_parse_with_defaults() {
        let mut flags = base_flags();
        flags.extend(fc_flags());
        let args = PickerArgs::try_parse_from(flags).unwrap();
        assert_eq!(args.ideal_bundle_size, 100 * (1 << 30));
        assert_eq!(args.common.work_retries, 3);
        assert_eq!(args.file_catalog.file_catalog_page_size, 1000);
        assert!(!args.common.run_once_and_die);
    }

    #[test]
    fn missing_required_keys_fail_fast() {
        let result = PickerArgs::try_parse_from(["lta", "--source-site", "WIPAC"]);
        assert!(result.is_err());
    }

    #[test]
    fn loop_exit_policy_accepts_explicit_booleans() {
        let mut flags = base_flags();
        flags.extend(fc_flags());
        flags.extend(["--run-until-no-work", "true"]);
        let args = PickerArgs::try_parse_from(flags).unwrap();
        let policy = args.common.loop_policy();
        assert!(policy.run_until_no_work);
        assert!(!policy.run_once_and_die);
    }

    #[test]
    fn status_overrides_must_name_a_known_status() {
        let mut flags = base_flags();
        flags.extend(fc_flags());
        flags.extend(["--input-status", "sideways"]);
        let args = PickerArgs::try_parse_from(flags).unwrap();
        assert!(args
            .common
            .input_bundle_status(BundleStatus::Specified)
            .is_err());
        let mut flags = base_flags();
        flags.extend(fc_flags());
        flags.extend(["--input-status", "located"]);
        let args = PickerArgs::try_parse_from(flags).unwrap();
        assert_eq!(
            args.common
                .input_bundle_status(BundleStatus::Specified)
                .unwrap(),
            BundleStatus::Located
        );
    }

    #[test]
    fn replicator_dest_url_honors_full_bundle_path() {
        let mut flags = base_flags();
        flags.extend([
            "--transfer-backend",
            "move",
            "--transfer-dest-url",
            "file:///mnt/archive",
        ]);
        let args = ReplicatorArgs::try_parse_from(flags.clone()).unwrap();
        let flat = args
            .transfer
            .dest_url_for("/data/exp/IceCube/2018", "abc.zip");
        assert_eq!(flat.as_str(), "file:///mnt/archive/abc.zip");

        flags.extend(["--use-full-bundle-path", "true"]);
        let args = ReplicatorArgs::try_parse_from(flags).unwrap();
        let full = args
            .transfer
            .dest_url_for("/data/exp/IceCube/2018", "abc.zip");
        assert_eq!(
            full.as_str(),
            "file:///mnt/archive/data/exp/IceCube/2018/abc.zip"
        );
    }

    #[test]
    fn fts_backend_requires_its_endpoints() {
        let mut flags = base_flags();
        flags.extend([
            "--transfer-backend",
            "fts",
            "--transfer-dest-url",
            "gsiftp://archive.example.org/pnfs/lta",
        ]);
        let args = ReplicatorArgs::try_parse_from(flags).unwrap();
        assert!(args.transfer.backend().is_err());
    }
}
