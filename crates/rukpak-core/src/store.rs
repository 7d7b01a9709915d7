//! The local, file-system-backed content cache plus its HTTP
//! publication layer.
//!
//! Invariants upheld here: exactly one archive per bundle UID; writes are
//! atomic against concurrent reads (write-to-temp, rename); a missing file
//! on `delete` is not an error.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client as KubeClient;
use rukpak_crd::Bundle;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::tree::{FileTree, TreeError};

#[derive(Snafu, Debug)]
pub enum StoreError {
    #[snafu(display("bundle has no UID, cannot address its cache entry"))]
    MissingUid,
    #[snafu(display("failed to serialize file tree"))]
    Serialize { source: TreeError },
    #[snafu(display("failed to deserialize file tree"))]
    Deserialize { source: TreeError },
    #[snafu(display("failed to create storage root {path:?}"))]
    CreateRoot { source: io::Error, path: PathBuf },
    #[snafu(display("failed to write temporary archive {path:?}"))]
    WriteTemp { source: io::Error, path: PathBuf },
    #[snafu(display("failed to rename temporary archive into place"))]
    Rename { source: io::Error },
    #[snafu(display("failed to read cached archive {path:?}"))]
    Read { source: io::Error, path: PathBuf },
    #[snafu(display("failed to remove cached archive {path:?}"))]
    RemoveFile { source: io::Error, path: PathBuf },
    #[snafu(display("cache entry for bundle {uid} does not exist"))]
    NotFound { uid: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Persist/retrieve/delete unpacked bundle content, keyed by bundle UID.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
    external_base_url: String,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>, external_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            external_base_url: external_base_url.into(),
        }
    }

    fn archive_path(&self, uid: &str) -> PathBuf {
        self.root.join(format!("{uid}.tgz"))
    }

    fn uid(bundle: &Bundle) -> Result<String> {
        bundle.metadata.uid.clone().context(MissingUidSnafu)
    }

    /// Serializes `tree` and writes it to `{root}/{bundle.uid}.tgz`,
    /// atomically: the archive is first written to a sibling temp file,
    /// then renamed into place, so a concurrent `Load` never observes a
    /// partially written archive and two concurrent `Store` calls for the
    /// same UID are serialized by the rename.
    pub async fn store(&self, bundle: &Bundle, tree: &FileTree) -> Result<()> {
        let uid = Self::uid(bundle)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|_| CreateRootSnafu {
                path: self.root.clone(),
            })?;

        let bytes = tree.to_tar_gz().context(SerializeSnafu)?;

        let tmp_path = self
            .root
            .join(format!(".{uid}-{}.tgz.tmp", Uuid::new_v4()));
        {
            let mut file =
                fs::File::create(&tmp_path)
                    .await
                    .with_context(|_| WriteTempSnafu {
                        path: tmp_path.clone(),
                    })?;
            file.write_all(&bytes)
                .await
                .with_context(|_| WriteTempSnafu {
                    path: tmp_path.clone(),
                })?;
            file.flush().await.with_context(|_| WriteTempSnafu {
                path: tmp_path.clone(),
            })?;
        }

        fs::rename(&tmp_path, self.archive_path(&uid))
            .await
            .context(RenameSnafu)
    }

    pub async fn load(&self, bundle: &Bundle) -> Result<FileTree> {
        let uid = Self::uid(bundle)?;
        self.load_by_uid(&uid).await
    }

    pub async fn load_by_uid(&self, uid: &str) -> Result<FileTree> {
        let path = self.archive_path(uid);
        let bytes = fs::read(&path).await.with_context(|_| ReadSnafu {
            path: path.clone(),
        })?;
        FileTree::from_tar_gz(&bytes).context(DeserializeSnafu)
    }

    /// Removes the archive; a missing file is not an error.
    pub async fn delete(&self, bundle: &Bundle) -> Result<()> {
        let uid = Self::uid(bundle)?;
        let path = self.archive_path(&uid);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|_| RemoveFileSnafu { path }),
        }
    }

    pub fn exists(&self, bundle: &Bundle) -> Result<bool> {
        let uid = Self::uid(bundle)?;
        Ok(self.archive_path(&uid).is_file())
    }

    /// `{external-base}/bundles/{owner.UID}`
    pub fn url_for(&self, bundle: &Bundle) -> Result<String> {
        let uid = Self::uid(bundle)?;
        Ok(format!(
            "{}/bundles/{uid}",
            self.external_base_url.trim_end_matches('/')
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Clone)]
struct HttpState {
    store: ContentStore,
    kube_client: KubeClient,
}

/// Mounts `GET /bundles/{uid}`, bearer-authenticated via a TokenReview
/// followed by a SubjectAccessReview for `get` on `bundles/{uid}`
/// (`bundles.rukpak.example.io/{uid}` as the resource name).
pub fn router(store: ContentStore, kube_client: KubeClient) -> Router {
    Router::new()
        .route("/bundles/{uid}", get(get_bundle))
        .with_state(Arc::new(HttpState { store, kube_client }))
}

async fn get_bundle(
    State(state): State<Arc<HttpState>>,
    AxumPath(uid): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let token = match bearer_token(&headers) {
        Some(t) => t,
        None => return StatusCode::UNAUTHORIZED.into_response(),
    };

    match authorize(&state.kube_client, &token, &uid).await {
        Ok(true) => {}
        Ok(false) => return StatusCode::FORBIDDEN.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "token review/authorization failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    match state.store.load_by_uid(&uid).await {
        Ok(tree) => match tree.to_tar_gz() {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/gzip")],
                Body::from(bytes),
            )
                .into_response(),
            Err(err) => {
                tracing::error!(error = %err, "failed to re-encode cached tree");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(StoreError::Read { .. }) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to load cached bundle");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

async fn authorize(
    client: &KubeClient,
    token: &str,
    uid: &str,
) -> std::result::Result<bool, kube::Error> {
    let token_reviews: Api<TokenReview> = Api::all(client.clone());
    let review = TokenReview {
        spec: TokenReviewSpec {
            token: Some(token.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let reviewed = token_reviews
        .create(&PostParams::default(), &review)
        .await?;
    let status = match reviewed.status {
        Some(status) if status.authenticated.unwrap_or(false) => status,
        _ => return Ok(false),
    };
    let user_name = status.user.and_then(|u| u.username).unwrap_or_default();

    let sars: Api<SubjectAccessReview> = Api::all(client.clone());
    let sar = SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: Some(user_name),
            resource_attributes: Some(ResourceAttributes {
                group: Some("rukpak.example.io".to_string()),
                resource: Some("bundles".to_string()),
                subresource: Some(uid.to_string()),
                verb: Some("get".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    let reviewed = sars.create(&PostParams::default(), &sar).await?;
    Ok(reviewed
        .status
        .map(|s| s.allowed)
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kube::core::ObjectMeta;
    use rukpak_crd::{BundleFormat, BundleSource, BundleSpec};

    fn bundle_with_uid(uid: &str) -> Bundle {
        Bundle {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: BundleSpec {
                provisioner_class_name: "core".to_string(),
                source: BundleSource::default(),
                format: BundleFormat::Plain,
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn store_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), "https://example.invalid");
        let bundle = bundle_with_uid("00000000-0000-0000-0000-000000000001");

        let mut tree = FileTree::new();
        tree.insert("manifests/a.yaml", Bytes::from_static(b"a: 1"));

        store.store(&bundle, &tree).await.unwrap();
        assert!(store.exists(&bundle).unwrap());

        let loaded = store.load(&bundle).await.unwrap();
        assert_eq!(loaded, tree);

        store.delete(&bundle).await.unwrap();
        assert!(!store.exists(&bundle).unwrap());

        // deleting again is not an error
        store.delete(&bundle).await.unwrap();
    }

    #[test]
    fn url_for_has_the_documented_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), "https://example.invalid/");
        let bundle = bundle_with_uid("abc-123");
        assert_eq!(
            store.url_for(&bundle).unwrap(),
            "https://example.invalid/bundles/abc-123"
        );
    }

    #[tokio::test]
    async fn load_missing_entry_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), "https://example.invalid");
        let bundle = bundle_with_uid("does-not-exist");
        assert!(matches!(
            store.load(&bundle).await,
            Err(StoreError::Read { .. })
        ));
    }
}
