// TODO: Look into how to properly resolve `clippy::result_large_err`.
// This will need changes in our and upstream error types.
#![allow(clippy::result_large_err)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures::{future, pin_mut, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Api, CustomResourceExt, ResourceExt};
use rukpak_core::store::ContentStore;
use rukpak_core::unpack::{CompositeUnpacker, UnpackCtx};
use rukpak_crd::{Bundle, BundleDeployment, SYSTEM_NAMESPACE_DEFAULT};
use snafu::{ResultExt, Snafu};
use stackable_operator::cli::{Command, CommonOptions};
use stackable_operator::logging::controller::report_controller_reconciled;
use stackable_operator::telemetry::Tracing;
use tokio::net::TcpListener;

mod bundle_controller;
mod ctx;
mod deployment_controller;
mod pivot;
mod render;

use ctx::Ctx;
use render::{NoopDynamicWatchManager, ServerSideApplyEngine};

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const OPERATOR_NAME: &str = "rukpak.example.io";
const BUNDLE_CONTROLLER_NAME: &str = "bundle.rukpak.example.io_provisioner";
const DEPLOYMENT_CONTROLLER_NAME: &str = "bundledeployment.rukpak.example.io_provisioner";

#[derive(Parser)]
#[clap(about, author, version = built_info::PKG_VERSION)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<RunArgs>,
}

#[derive(clap::Parser)]
struct RunArgs {
    /// Which `provisionerClassName` this process reconciles; `Bundle`s and
    /// `BundleDeployment`s naming any other class are ignored.
    #[clap(long, env, default_value = "core")]
    provisioner_class_name: String,

    /// Address the content-store HTTP publication server and health probes
    /// bind to.
    #[clap(long, env, default_value = "0.0.0.0:8080")]
    http_bind_address: String,

    /// Base URL at which the content-store HTTP server above is reachable
    /// from inside the cluster, stamped into `Bundle.status.contentURL`.
    #[clap(long, env)]
    external_base_url: String,

    #[clap(long, env, default_value = SYSTEM_NAMESPACE_DEFAULT)]
    system_namespace: String,

    /// Image reference used for the init container that copies the
    /// unpack-helper binary into image/ociArtifact unpack pods.
    #[clap(long, env)]
    unpack_helper_image: String,

    /// Base URL of the upload-manager service, consulted by the `upload`
    /// source unpacker.
    #[clap(long, env)]
    upload_manager_base_url: String,

    /// Root directory the local content cache writes unpacked archives
    /// under.
    #[clap(long, env, default_value = "/var/lib/rukpak/bundles")]
    storage_dir: PathBuf,

    /// Additional CA bundle trusted when this process's HTTP client (image,
    /// http and ociArtifact source unpackers) dials an upstream content
    /// server over TLS.
    #[clap(long, env)]
    bundle_ca_file: Option<PathBuf>,

    #[clap(
        long,
        env,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    service_account_token_path: PathBuf,

    /// Reject plain-format bundles whose `manifests/` directory contains no
    /// objects, instead of the lenient upstream default of installing
    /// nothing.
    #[clap(long, env, default_value_t = false)]
    reject_empty_object_set: bool,

    /// Accepted for interface parity with a multi-replica deployment; this
    /// build does not itself acquire a `Lease`, so running more than one
    /// replica of the same `provisionerClassName` is only safe behind an
    /// external election (or not at all, given the single-writer content
    /// cache).
    #[clap(long, env, default_value_t = false)]
    enable_leader_election: bool,

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

    #[snafu(display("failed to build an HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("failed to read bundle CA file {path:?}"))]
    ReadBundleCaFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse bundle CA file {path:?}"))]
    ParseBundleCaFile {
        source: reqwest::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to print CRD schema"))]
    PrintCrd { source: serde_yaml::Error },

    #[snafu(display("failed to register SIGTERM handler"))]
    RegisterSigterm { source: std::io::Error },

    #[snafu(display("failed to bind listener on {address}"))]
    BindListener {
        source: std::io::Error,
        address: String,
    },

    #[snafu(display("failed to run content-store server"))]
    RunServer { source: std::io::Error },
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let opts = Opts::parse();

    // As stackable-operator pulls in ring and reqwest >= 0.12 can pull in
    // aws_lc_rs, tell rustls what provider to use explicitly so the choice
    // doesn't depend on crate initialization order.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install ring rustls provider");

    match opts.cmd {
        Command::Crd => {
            print!(
                "{}",
                serde_yaml::to_string(&Bundle::crd()).context(PrintCrdSnafu)?
            );
            println!("---");
            print!(
                "{}",
                serde_yaml::to_string(&BundleDeployment::crd()).context(PrintCrdSnafu)?
            );
        }
        Command::Run(args) => run(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<(), StartupError> {
    let _tracing_guard = Tracing::pre_configured(built_info::PKG_NAME, args.common.telemetry)
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

    if args.enable_leader_election {
        tracing::warn!(
            "leader election was requested, but this build assumes a single replica per \
             provisionerClassName and does not itself acquire a Lease"
        );
    }

    let client = stackable_operator::client::initialize_operator(
        Some(OPERATOR_NAME.to_string()),
        &args.common.cluster_info,
    )
    .await
    .context(InitKubeSnafu)?;
    let kube_client = client.as_kube_client();

    let mut http_client_builder = reqwest::Client::builder();
    if let Some(ca_path) = &args.bundle_ca_file {
        let pem = std::fs::read(ca_path).with_context(|_| ReadBundleCaFileSnafu {
            path: ca_path.clone(),
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).with_context(|_| ParseBundleCaFileSnafu {
            path: ca_path.clone(),
        })?;
        http_client_builder = http_client_builder.add_root_certificate(cert);
    }
    let http_client = http_client_builder
        .build()
        .context(BuildHttpClientSnafu)?;

    let content_store = ContentStore::new(args.storage_dir.clone(), args.external_base_url.clone());

    let unpack_ctx = UnpackCtx {
        kube_client: kube_client.clone(),
        http_client,
        system_namespace: args.system_namespace.clone(),
        unpack_helper_image: args.unpack_helper_image.clone(),
        content_store: content_store.clone(),
        turn_deadline: Duration::from_secs(30),
        upload_manager_base_url: args.upload_manager_base_url.clone(),
        service_account_token_path: args.service_account_token_path.clone(),
    };

    let reconciler_ctx = Arc::new(Ctx {
        provisioner_class_name: args.provisioner_class_name.clone(),
        unpack_ctx,
        unpacker: CompositeUnpacker::new(),
        content_store: content_store.clone(),
        apply_engine: Arc::new(ServerSideApplyEngine),
        dynamic_watch_manager: Arc::new(NoopDynamicWatchManager),
        reject_empty_object_set: args.reject_empty_object_set,
    });

    tokio::spawn(run_bundle_controller(kube_client.clone(), reconciler_ctx.clone()));
    tokio::spawn(run_deployment_controller(kube_client.clone(), reconciler_ctx));

    let shutdown_requested = tokio::signal::ctrl_c().map(|_| ());
    #[cfg(unix)]
    let shutdown_requested = {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context(RegisterSigtermSnafu)?;
        async move {
            let sigterm = sigterm.recv().map(|_| ());
            pin_mut!(shutdown_requested, sigterm);
            future::select(shutdown_requested, sigterm).await;
        }
    };

    let app = Router::new()
        .merge(rukpak_core::store::router(content_store, kube_client))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = TcpListener::bind(&args.http_bind_address)
        .await
        .with_context(|_| BindListenerSnafu {
            address: args.http_bind_address.clone(),
        })?;
    tracing::info!(address = %args.http_bind_address, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_requested)
        .await
        .context(RunServerSnafu)
}

/// True when `bundle`'s `configMaps`/`local` source names `config_map_name`,
/// i.e. a change to that `ConfigMap` should re-enqueue this bundle.
fn bundle_references_config_map(bundle: &Bundle, config_map_name: &str) -> bool {
    bundle
        .spec
        .source
        .config_maps
        .as_ref()
        .is_some_and(|cfg| {
            cfg.config_maps
                .iter()
                .any(|entry| entry.config_map.name.as_deref() == Some(config_map_name))
        })
        || bundle
            .spec
            .source
            .local
            .as_ref()
            .is_some_and(|local| local.source_ref.name.as_deref() == Some(config_map_name))
}

/// Bound to `provisioner_class_name`; additionally watches unpack `Pod`s
/// (owned by their bundle, to pick up image-unpack phase transitions) and
/// `ConfigMap`s in the system namespace (to re-enqueue bundles whose
/// `configMaps`/`local` source names one that changed), per spec.md §4.2's
/// reconciler setup.
async fn run_bundle_controller(kube_client: kube::Client, ctx: Arc<Ctx>) {
    let bundles: Api<Bundle> = Api::all(kube_client.clone());
    let pods: Api<Pod> = Api::namespaced(kube_client.clone(), &ctx.unpack_ctx.system_namespace);
    let config_maps: Api<ConfigMap> =
        Api::namespaced(kube_client.clone(), &ctx.unpack_ctx.system_namespace);

    let controller = Controller::new(bundles, watcher::Config::default());
    let bundle_store = controller.store();
    let controller = controller
        .owns(pods, watcher::Config::default())
        .watches(config_maps, watcher::Config::default(), move |config_map| {
            let config_map_name = config_map.name_any();
            bundle_store
                .state()
                .into_iter()
                .filter(move |bundle| bundle_references_config_map(bundle, &config_map_name))
                .map(|bundle| ObjectRef::from_obj(bundle.as_ref()))
                .collect::<Vec<_>>()
        });

    let event_recorder = Arc::new(Recorder::new(
        kube_client,
        Reporter {
            controller: BUNDLE_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    controller
        .run(bundle_controller::reconcile, bundle_controller::error_policy, ctx)
        .for_each_concurrent(16, |result| {
            let event_recorder = event_recorder.clone();
            async move {
                report_controller_reconciled(&event_recorder, BUNDLE_CONTROLLER_NAME, &result)
                    .await;
            }
        })
        .await;
}

/// Additionally owns the generated `Bundle`s (see `pivot::generated_bundle_name`)
/// so a bundle reaching `Unpacked` re-enqueues its owning deployment
/// immediately instead of waiting on the 5s poll in `apply`'s pending path.
async fn run_deployment_controller(kube_client: kube::Client, ctx: Arc<Ctx>) {
    let deployments: Api<BundleDeployment> = Api::all(kube_client.clone());
    let bundles: Api<Bundle> = Api::all(kube_client.clone());
    let event_recorder = Arc::new(Recorder::new(
        kube_client,
        Reporter {
            controller: DEPLOYMENT_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    Controller::new(deployments, watcher::Config::default())
        .owns(bundles, watcher::Config::default())
        .run(
            deployment_controller::reconcile,
            deployment_controller::error_policy,
            ctx,
        )
        .for_each_concurrent(16, |result| {
            let event_recorder = event_recorder.clone();
            async move {
                report_controller_reconciled(&event_recorder, DEPLOYMENT_CONTROLLER_NAME, &result)
                    .await;
            }
        })
        .await;
}
