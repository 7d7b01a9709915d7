//! The bundle-deployment reconciler.
//!
//! Per turn: ensure the generated `Bundle` tracking this deployment's
//! template exists → wait for it to report `Unpacked` → load its content
//! directly from the content store (this binary runs both the bundle and
//! bundle-deployment reconcilers, so there is no need to go back out over
//! HTTP — see DESIGN.md) → render and apply → install dynamic watches →
//! track `activeBundle` and pivot.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Resource, ResourceExt};
use rukpak_crd::{
    conditions, validate, Bundle, BundleDeployment, BundleDeploymentPhase, BundlePhase,
    BundleSpec, FINALIZER_CLEANUP_UNPACK_CACHE,
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::ctx::Ctx;
use crate::pivot::generated_bundle_name;
use crate::render::{self, FIELD_MANAGER};

pub const CONTROLLER_NAME: &str = "bundledeployment.rukpak.example.io/provisioner";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("finalizer chain failed"))]
    Finalizer {
        source: Box<kube::runtime::finalizer::Error<Error>>,
    },
    #[snafu(display("failed to ensure the generated bundle exists"))]
    EnsureBundle { source: kube::Error },
    #[snafu(display("failed to load bundle content from the store"))]
    LoadContent { source: rukpak_core::StoreError },
    #[snafu(display("failed to render manifests"))]
    Render { source: crate::render::RenderError },
    #[snafu(display("failed to apply rendered objects"))]
    Apply { source: crate::render::ApplyError },
    #[snafu(display("failed to patch bundle-deployment status"))]
    PatchStatus { source: kube::Error },
    #[snafu(display("bundle-deployment has no UID, cannot build an owner reference"))]
    MissingUid,
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl stackable_operator::logging::controller::ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile(deployment: Arc<BundleDeployment>, ctx: Arc<Ctx>) -> Result<Action> {
    if deployment.spec.provisioner_class_name != ctx.provisioner_class_name {
        return Ok(Action::await_change());
    }

    let deployments: Api<BundleDeployment> = Api::all(ctx.unpack_ctx.kube_client.clone());
    finalizer(
        &deployments,
        FINALIZER_CLEANUP_UNPACK_CACHE,
        deployment,
        |event| async {
            match event {
                FinalizerEvent::Apply(deployment) => {
                    apply(&deployments, deployment.as_ref(), &ctx).await
                }
                FinalizerEvent::Cleanup(deployment) => cleanup(deployment.as_ref(), &ctx).await,
            }
        },
    )
    .await
    .map_err(|e| Error::Finalizer { source: Box::new(e) })
}

pub fn error_policy(_deployment: Arc<BundleDeployment>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

async fn apply(
    deployments: &Api<BundleDeployment>,
    deployment: &BundleDeployment,
    ctx: &Ctx,
) -> Result<Action> {
    let generation = deployment.metadata.generation.unwrap_or_default();
    let name = deployment.name_any();

    if let Err(err) =
        validate::validate_name(&name).and_then(|()| validate::validate_source(&deployment.spec.template.source))
    {
        let message = err.to_string();
        patch_status(deployments, deployment, generation, |status| {
            status.phase = BundleDeploymentPhase::Failing;
            conditions::set_condition(
                &mut status.conditions,
                conditions::TYPE_VALIDATED,
                false,
                conditions::REASON_VALIDATION_FAILED,
                message,
                generation,
            );
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let bundles: Api<Bundle> = Api::all(ctx.unpack_ctx.kube_client.clone());
    let generated_name = generated_bundle_name(&name, &deployment.spec.template);
    let bundle = ensure_bundle(&bundles, deployment, &generated_name).await?;

    if bundle.status.as_ref().map(|s| s.phase) != Some(BundlePhase::Unpacked) {
        let (reason, message) = match bundle.status.as_ref().map(|s| s.phase) {
            Some(BundlePhase::Failing) => (
                conditions::REASON_UNPACK_FAILED,
                "generated bundle failed to unpack".to_string(),
            ),
            _ => (
                conditions::REASON_UNPACK_PENDING,
                "waiting for generated bundle to become Unpacked".to_string(),
            ),
        };
        patch_status(deployments, deployment, generation, |status| {
            status.phase = BundleDeploymentPhase::Unpacking;
            conditions::set_condition(
                &mut status.conditions,
                conditions::TYPE_HAS_VALID_BUNDLE,
                false,
                reason,
                message,
                generation,
            );
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    patch_status(deployments, deployment, generation, |status| {
        status.phase = BundleDeploymentPhase::Unpacked;
        conditions::set_condition(
            &mut status.conditions,
            conditions::TYPE_HAS_VALID_BUNDLE,
            true,
            conditions::REASON_UNPACK_SUCCESSFUL,
            "generated bundle is unpacked",
            generation,
        );
    })
    .await?;

    if deployment.spec.paused {
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    let tree = ctx
        .content_store
        .load_by_uid(bundle.metadata.uid.as_deref().unwrap_or_default())
        .await
        .context(LoadContentSnafu)?;

    let owner = owner_reference(deployment)?;
    let objects = render::render_manifests(&tree, &deployment.spec.install_namespace, owner)
        .context(RenderSnafu)?;

    let apply_outcome = ctx
        .apply_engine
        .apply(&ctx.unpack_ctx.kube_client, objects)
        .await;

    let gvks = match apply_outcome {
        Ok(gvks) => {
            patch_status(deployments, deployment, generation, |status| {
                status.phase = BundleDeploymentPhase::Installed;
                status.active_bundle = Some(generated_name.clone());
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_INSTALLED,
                    true,
                    conditions::REASON_INSTALLATION_SUCCEEDED,
                    "installation succeeded",
                    generation,
                );
            })
            .await?;
            gvks
        }
        Err(err) => {
            let message = err.to_string();
            patch_status(deployments, deployment, generation, |status| {
                status.phase = BundleDeploymentPhase::Failing;
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_INSTALLED,
                    false,
                    conditions::REASON_INSTALL_FAILED,
                    message.clone(),
                    generation,
                );
            })
            .await?;
            return Err(err).context(ApplySnafu);
        }
    };

    match ctx.dynamic_watch_manager.ensure_watches(&gvks) {
        Ok(()) => {
            patch_status(deployments, deployment, generation, |status| {
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_DYNAMIC_WATCHES_FAILED,
                    false,
                    conditions::REASON_DYNAMIC_WATCHES_ESTABLISHED,
                    "dynamic watches installed",
                    generation,
                );
            })
            .await?;
        }
        Err(err) => {
            let message = err.to_string();
            patch_status(deployments, deployment, generation, |status| {
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_DYNAMIC_WATCHES_FAILED,
                    true,
                    conditions::REASON_DYNAMIC_WATCHES_FAILED,
                    message,
                    generation,
                );
            })
            .await?;
        }
    }

    pivot_gc(&bundles, deployment, &generated_name).await;

    Ok(Action::requeue(Duration::from_secs(60)))
}

/// During a pivot, the old generated bundle is left in place until the new
/// one reaches `InstallationSucceeded` (enforced by the caller only
/// reaching this point after that happens), then it is deleted so its
/// finalizer can release the cached archive.
async fn pivot_gc(bundles: &Api<Bundle>, deployment: &BundleDeployment, new_bundle_name: &str) {
    let Some(previous) = deployment
        .status
        .as_ref()
        .and_then(|s| s.active_bundle.as_deref())
    else {
        return;
    };
    if previous == new_bundle_name {
        return;
    }
    if let Err(err) = bundles.delete(previous, &DeleteParams::default()).await {
        if !matches!(&err, kube::Error::Api(e) if e.code == 404) {
            tracing::warn!(
                error = %err,
                bundle = previous,
                "failed to garbage-collect the previous generated bundle after pivot"
            );
        }
    }
}

async fn cleanup(deployment: &BundleDeployment, ctx: &Ctx) -> Result<Action> {
    let generated_name = generated_bundle_name(&deployment.name_any(), &deployment.spec.template);
    let synthetic_bundle = Bundle {
        metadata: ObjectMeta {
            name: Some(generated_name),
            ..Default::default()
        },
        spec: BundleSpec {
            provisioner_class_name: deployment.spec.template.provisioner_class_name.clone(),
            source: deployment.spec.template.source.clone(),
            format: deployment.spec.template.format,
        },
        status: None,
    };
    let _ = ctx
        .unpacker
        .cleanup(&ctx.unpack_ctx, &synthetic_bundle)
        .await;
    Ok(Action::await_change())
}

async fn ensure_bundle(
    bundles: &Api<Bundle>,
    deployment: &BundleDeployment,
    generated_name: &str,
) -> Result<Bundle> {
    match bundles.get(generated_name).await {
        Ok(bundle) => Ok(bundle),
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let owner = owner_reference(deployment)?;
            let bundle = Bundle {
                metadata: ObjectMeta {
                    name: Some(generated_name.to_string()),
                    owner_references: Some(vec![owner]),
                    ..Default::default()
                },
                spec: BundleSpec {
                    provisioner_class_name: deployment.spec.template.provisioner_class_name.clone(),
                    source: deployment.spec.template.source.clone(),
                    format: deployment.spec.template.format,
                },
                status: None,
            };
            match bundles.create(&PostParams::default(), &bundle).await {
                Ok(bundle) => Ok(bundle),
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    bundles.get(generated_name).await.context(EnsureBundleSnafu)
                }
                Err(err) => Err(err).context(EnsureBundleSnafu),
            }
        }
        Err(err) => Err(err).context(EnsureBundleSnafu),
    }
}

fn owner_reference(deployment: &BundleDeployment) -> Result<OwnerReference> {
    let uid = deployment.metadata.uid.clone().context(MissingUidSnafu)?;
    Ok(OwnerReference {
        api_version: BundleDeployment::api_version(&()).into_owned(),
        kind: BundleDeployment::kind(&()).into_owned(),
        name: deployment.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

async fn patch_status(
    deployments: &Api<BundleDeployment>,
    deployment: &BundleDeployment,
    generation: i64,
    mutate: impl FnOnce(&mut rukpak_crd::BundleDeploymentStatus),
) -> Result<()> {
    let mut status = deployment.status.clone().unwrap_or_default();
    status.observed_generation = Some(generation);
    mutate(&mut status);

    let patch = json!({
        "apiVersion": "rukpak.example.io/v1alpha1",
        "kind": "BundleDeployment",
        "status": status,
    });
    deployments
        .patch_status(
            &deployment.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await
        .context(PatchStatusSnafu)?;
    Ok(())
}
