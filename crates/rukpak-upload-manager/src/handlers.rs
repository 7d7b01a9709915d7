//! The upload-intake HTTP surface: `GET`/`PUT /uploads/{name}.tgz`.
//!
//! `PUT` upholds the immutability of an accepted upload entry: identical
//! bytes re-uploaded after acceptance return 204 unchanged, differing
//! bytes after the owning deployment is `Unpacked` return 409.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client as KubeClient, ResourceExt};
use rukpak_core::upload_store::UploadStore;
use rukpak_crd::{conditions, BundleDeployment, SourceKind};
use serde_json::json;

const FIELD_MANAGER: &str = "rukpak-upload-manager";
const MAX_PATCH_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: UploadStore,
    pub kube_client: KubeClient,
}

/// Built as two sub-routers on distinct state types, merged together:
/// `GET` only ever needs the store, so it is kept independently testable
/// without a live Kubernetes API server.
pub fn router(state: AppState) -> Router {
    let get_router = Router::new()
        .route("/uploads/{name}.tgz", get(get_upload))
        .with_state(state.store.clone());
    let put_router = Router::new()
        .route("/uploads/{name}.tgz", axum::routing::put(put_upload))
        .with_state(Arc::new(state));

    get_router
        .merge(put_router)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

async fn get_upload(State(store): State<UploadStore>, Path(name): Path<String>) -> Response {
    match store.load(&name).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/gzip")],
            Body::from(bytes),
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_upload(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let deployments: Api<BundleDeployment> = Api::all(state.kube_client.clone());

    let deployment = match deployments.get_opt(&name).await {
        Ok(Some(deployment)) => deployment,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(error = %err, name, "failed to fetch BundleDeployment");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if deployment.spec.template.source.kind != SourceKind::Upload {
        return (
            StatusCode::CONFLICT,
            "source type of this deployment is not upload",
        )
            .into_response();
    }

    if let Ok(existing) = state.store.load(&name).await {
        if existing == body {
            return StatusCode::NO_CONTENT.into_response();
        }
    }

    let already_unpacked = deployment
        .status
        .as_ref()
        .map(|s| conditions::condition_is_true(&s.conditions, conditions::TYPE_UNPACKED))
        .unwrap_or(false);
    if already_unpacked {
        return (
            StatusCode::CONFLICT,
            "cannot change content of existing bundle",
        )
            .into_response();
    }

    if let Err(err) = state.store.store(&name, &body).await {
        tracing::error!(error = %err, name, "failed to write upload blob");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(err) = mark_upload_accepted(&deployments, &name).await {
        tracing::error!(error = %err, name, "failed to patch upload status after a successful write");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    StatusCode::CREATED.into_response()
}

/// Sets `UploadStatus=True/UploadSuccessful` and `Unpacked=False/UnpackPending`
/// (the reconciler flips `Unpacked` once it actually completes). Retries on
/// a 409 conflict by re-fetching the object and re-applying the patch.
async fn mark_upload_accepted(
    deployments: &Api<BundleDeployment>,
    name: &str,
) -> Result<(), kube::Error> {
    for attempt in 0..MAX_PATCH_ATTEMPTS {
        let current = deployments.get(name).await?;
        let mut status = current.status.clone().unwrap_or_default();
        let generation = current.metadata.generation.unwrap_or_default();
        status.observed_generation = Some(generation);
        conditions::set_condition(
            &mut status.conditions,
            conditions::TYPE_UPLOAD_STATUS,
            true,
            conditions::REASON_UPLOAD_SUCCESSFUL,
            "upload accepted",
            generation,
        );
        conditions::set_condition(
            &mut status.conditions,
            conditions::TYPE_UNPACKED,
            false,
            conditions::REASON_UNPACK_PENDING,
            "waiting for the reconciler to unpack the uploaded content",
            generation,
        );

        let patch = json!({
            "apiVersion": "rukpak.example.io/v1alpha1",
            "kind": "BundleDeployment",
            "metadata": { "resourceVersion": current.resource_version() },
            "status": status,
        });

        match deployments
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt + 1 < MAX_PATCH_ATTEMPTS => {
                tracing::debug!(name, attempt, "status patch conflicted, retrying");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop always returns within MAX_PATCH_ATTEMPTS")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router(store: UploadStore) -> Router {
        // Exercises only the read path; `put_upload`'s deployment lookup
        // needs a live apiserver, so the 201/409-after-fetch paths are left
        // to the reconciler-facing integration tests in `rukpak-provisioner`.
        Router::new()
            .route("/uploads/{name}.tgz", get(get_upload))
            .with_state(store)
    }

    #[tokio::test]
    async fn get_missing_upload_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(UploadStore::new(dir.path()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/uploads/demo.tgz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_existing_upload_returns_its_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        store.store("demo", b"blob-bytes").await.unwrap();
        let router = test_router(store);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/uploads/demo.tgz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"blob-bytes"));
    }
}
