//! The upload intake service. Runs independently of
//! `rukpak-provisioner` (it is addressed by the provisioner's
//! `--upload-manager-base-url` flag), so that a cluster operator can scale
//! or restart the two processes separately.

use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use kube::Api;
use rukpak_core::upload_store::UploadStore;
use rukpak_crd::BundleDeployment;
use snafu::{ResultExt, Snafu};
use stackable_operator::cli::CommonOptions;
use stackable_operator::telemetry::Tracing;
use tokio::net::TcpListener;

mod gc;
mod handlers;

use handlers::AppState;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const OPERATOR_NAME: &str = "rukpak-upload-manager.rukpak.example.io";

#[derive(Parser)]
#[clap(about, author, version = built_info::PKG_VERSION)]
struct Opts {
    /// Address the upload-intake HTTP server and health probes bind to.
    #[clap(long, env, default_value = "0.0.0.0:8081")]
    http_bind_address: String,

    /// Root directory uploaded `.tgz` blobs are written under, one file per
    /// `{BundleDeployment name}.tgz`.
    #[clap(long, env, default_value = "/var/lib/rukpak/uploads")]
    storage_dir: PathBuf,

    /// How often the orphan-upload GC sweep runs, in seconds.
    #[clap(long, env, default_value_t = 60)]
    upload_gc_interval_secs: u64,

    #[clap(flatten)]
    common: CommonOptions,
}

#[derive(Snafu, Debug)]
enum StartupError {
    #[snafu(display("failed to initialize Kubernetes client"))]
    InitKube {
        source: stackable_operator::client::Error,
    },
    #[snafu(display("failed to initialize stackable-telemetry"))]
    TracingInit {
        source: stackable_operator::telemetry::tracing::Error,
    },
    #[snafu(display("failed to bind listener on {address}"))]
    BindListener {
        source: std::io::Error,
        address: String,
    },
    #[snafu(display("failed to run upload-intake server"))]
    RunServer { source: std::io::Error },
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let opts = Opts::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install ring rustls provider");

    let _tracing_guard = Tracing::pre_configured(built_info::PKG_NAME, opts.common.telemetry)
        .init()
        .context(TracingInitSnafu)?;

    tracing::info!(
        built_info.pkg_version = built_info::PKG_VERSION,
        built_info.git_version = built_info::GIT_VERSION,
        built_info.target = built_info::TARGET,
        built_info.built_time_utc = built_info::BUILT_TIME_UTC,
        built_info.rustc_version = built_info::RUSTC_VERSION,
        "Starting {description}",
        description = built_info::PKG_DESCRIPTION,
    );

    let client = stackable_operator::client::initialize_operator(
        Some(OPERATOR_NAME.to_string()),
        &opts.common.cluster_info,
    )
    .await
    .context(InitKubeSnafu)?;
    let kube_client = client.as_kube_client();

    let store = UploadStore::new(opts.storage_dir.clone());
    let deployments: Api<BundleDeployment> = Api::all(kube_client.clone());

    tokio::spawn(gc::run(
        store.clone(),
        deployments,
        Duration::from_secs(opts.upload_gc_interval_secs),
    ));

    let app: Router = handlers::router(AppState {
        store,
        kube_client,
    });

    let listener = TcpListener::bind(&opts.http_bind_address)
        .await
        .with_context(|_| BindListenerSnafu {
            address: opts.http_bind_address.clone(),
        })?;
    tracing::info!(address = %opts.http_bind_address, "listening");

    axum::serve(listener, app.into_make_service())
        .await
        .context(RunServerSnafu)
}
