//! The bundle reconciler.
//!
//! One reconcile turn, in order: finalizer chain → invoke the source
//! unpacker → format-specific transform → persist to the content store →
//! publish URL → status. The status subresource
//! is always patched before the turn returns, including inside the
//! finalizer's `Cleanup` arm, so a status reflecting the final phase is
//! observable even if the subsequent finalizer-removal patch races a delete.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::ResourceExt;
use rukpak_core::transform::{self, TransformCtx};
use rukpak_core::unpack::UnpackState;
use rukpak_crd::{conditions, Bundle, BundlePhase, FINALIZER_DELETE_CACHED_BUNDLE};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::ctx::Ctx;
use crate::render::FIELD_MANAGER;

pub const CONTROLLER_NAME: &str = "bundle.rukpak.example.io/provisioner";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("finalizer chain failed"))]
    Finalizer {
        source: Box<kube::runtime::finalizer::Error<Error>>,
    },
    #[snafu(display("source unpacker failed"))]
    Unpack { source: rukpak_core::unpack::UnpackError },
    #[snafu(display("content transform failed"))]
    Transform { source: rukpak_core::transform::TransformError },
    #[snafu(display("content store operation failed"))]
    Store { source: rukpak_core::StoreError },
    #[snafu(display("failed to patch bundle status"))]
    PatchStatus { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl stackable_operator::logging::controller::ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile(bundle: Arc<Bundle>, ctx: Arc<Ctx>) -> Result<Action> {
    if bundle.spec.provisioner_class_name != ctx.provisioner_class_name {
        return Ok(Action::await_change());
    }

    let bundles: Api<Bundle> = Api::all(ctx.unpack_ctx.kube_client.clone());
    finalizer(&bundles, FINALIZER_DELETE_CACHED_BUNDLE, bundle, |event| async {
        match event {
            FinalizerEvent::Apply(bundle) => apply(&bundles, bundle.as_ref(), &ctx).await,
            FinalizerEvent::Cleanup(bundle) => cleanup(bundle.as_ref(), &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer { source: Box::new(e) })
}

pub fn error_policy(_bundle: Arc<Bundle>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

async fn apply(bundles: &Api<Bundle>, bundle: &Bundle, ctx: &Ctx) -> Result<Action> {
    let generation = bundle.metadata.generation.unwrap_or_default();

    let unpack_result = ctx
        .unpacker
        .unpack(&ctx.unpack_ctx, bundle)
        .await
        .context(UnpackSnafu)?;

    match unpack_result.state {
        UnpackState::Pending => {
            patch_status(bundles, bundle, generation, |status| {
                status.phase = BundlePhase::Pending;
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_UNPACKED,
                    false,
                    conditions::REASON_UNPACK_PENDING,
                    unpack_result.message.clone(),
                    generation,
                );
            })
            .await?;
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        UnpackState::Unpacking => {
            patch_status(bundles, bundle, generation, |status| {
                status.phase = BundlePhase::Unpacking;
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_UNPACKED,
                    false,
                    conditions::REASON_UNPACKING,
                    unpack_result.message.clone(),
                    generation,
                );
            })
            .await?;
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        UnpackState::Unpacked => {}
    }

    let tree = unpack_result.tree.expect("unpacked state always carries a tree");
    let resolved_source = unpack_result
        .resolved_source
        .expect("unpacked state always carries a resolved source");

    // A Bundle carries no namespace of its own (only its owning
    // BundleDeployment does), so the registry transform's install-mode
    // check always runs against an empty target-namespace set here.
    let transform_ctx = TransformCtx {
        target_namespaces: vec![],
        reject_empty_object_set: ctx.reject_empty_object_set,
    };
    let tree = match transform::transform(bundle.spec.format, tree, &transform_ctx) {
        Ok(tree) => tree,
        Err(err) => {
            let message = err.to_string();
            patch_status(bundles, bundle, generation, |status| {
                status.phase = BundlePhase::Failing;
                conditions::set_condition(
                    &mut status.conditions,
                    conditions::TYPE_HAS_VALID_BUNDLE,
                    false,
                    conditions::REASON_UNPACK_FAILED,
                    message.clone(),
                    generation,
                );
            })
            .await?;
            return Err(err).context(TransformSnafu);
        }
    };

    if let Err(err) = ctx.content_store.store(bundle, &tree).await {
        let message = err.to_string();
        patch_status(bundles, bundle, generation, |status| {
            status.phase = BundlePhase::Failing;
            conditions::set_condition(
                &mut status.conditions,
                conditions::TYPE_UNPACKED,
                false,
                conditions::REASON_UNPACK_FAILED,
                message.clone(),
                generation,
            );
        })
        .await?;
        return Err(err).context(StoreSnafu);
    }

    let content_url = ctx.content_store.url_for(bundle).context(StoreSnafu)?;

    patch_status(bundles, bundle, generation, |status| {
        status.phase = BundlePhase::Unpacked;
        status.resolved_source = Some(resolved_source.clone());
        status.content_url = Some(content_url.clone());
        conditions::set_condition(
            &mut status.conditions,
            conditions::TYPE_UNPACKED,
            true,
            conditions::REASON_UNPACK_SUCCESSFUL,
            "unpack successful",
            generation,
        );
    })
    .await?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn cleanup(bundle: &Bundle, ctx: &Ctx) -> Result<Action> {
    ctx.content_store.delete(bundle).await.context(StoreSnafu)?;
    ctx.unpacker
        .cleanup(&ctx.unpack_ctx, bundle)
        .await
        .context(UnpackSnafu)?;
    Ok(Action::await_change())
}

async fn patch_status(
    bundles: &Api<Bundle>,
    bundle: &Bundle,
    generation: i64,
    mutate: impl FnOnce(&mut rukpak_crd::BundleStatus),
) -> Result<()> {
    let mut status = bundle.status.clone().unwrap_or_default();
    status.observed_generation = Some(generation);
    mutate(&mut status);

    let patch = json!({
        "apiVersion": "rukpak.example.io/v1alpha1",
        "kind": "Bundle",
        "status": status,
    });
    bundles
        .patch_status(
            &bundle.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await
        .context(PatchStatusSnafu)?;
    Ok(())
}
