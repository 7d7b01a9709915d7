//! Source unpackers. Each variant resolves an external origin
//! reference into a normalized, in-memory [`FileTree`] plus a
//! [`ResolvedSource`] descriptor pinned to an immutable identifier.
//!
//! Replaces reflection-driven, runtime-polymorphic source handling with a
//! closed sum (`SourceKind`) dispatched by [`CompositeUnpacker`], built once
//! at process start from explicit configuration (no mutable globals).

pub mod configmaps;
pub mod git;
pub mod http;
pub mod image;
pub mod local;
pub mod oci;
pub mod upload;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client as KubeClient;
use rukpak_crd::{Bundle, ResolvedSource, SourceKind};
use snafu::{OptionExt, Snafu};

use crate::store::ContentStore;
use crate::tree::FileTree;

/// Non-terminal states carry a human-readable `message` that the bundle
/// reconciler copies verbatim into the `Unpacked` condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnpackState {
    /// No terminal outcome yet (image pulling, upload awaited, ...).
    Pending,
    /// Work is observably in progress.
    Unpacking,
    /// Terminal success.
    Unpacked,
}

#[derive(Debug)]
pub struct UnpackResult {
    pub state: UnpackState,
    pub message: String,
    /// Present only when `state == Unpacked`.
    pub tree: Option<FileTree>,
    /// Present only when `state == Unpacked`.
    pub resolved_source: Option<ResolvedSource>,
}

impl UnpackResult {
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            state: UnpackState::Pending,
            message: message.into(),
            tree: None,
            resolved_source: None,
        }
    }

    pub fn unpacking(message: impl Into<String>) -> Self {
        Self {
            state: UnpackState::Unpacking,
            message: message.into(),
            tree: None,
            resolved_source: None,
        }
    }

    pub fn unpacked(tree: FileTree, resolved_source: ResolvedSource) -> Self {
        Self {
            state: UnpackState::Unpacked,
            message: "unpack successful".to_string(),
            tree: Some(tree),
            resolved_source: Some(resolved_source),
        }
    }
}

#[derive(Snafu, Debug)]
pub enum UnpackError {
    #[snafu(display("source type {kind} not supported"))]
    UnsupportedSourceType { kind: SourceKind },
    #[snafu(display("bundle source is missing the {kind} configuration block"))]
    MissingSourceConfig { kind: SourceKind },
    #[snafu(display("image source unpack failed"))]
    Image { source: image::Error },
    #[snafu(display("git source unpack failed"))]
    Git { source: git::Error },
    #[snafu(display("http source unpack failed"))]
    Http { source: http::Error },
    #[snafu(display("upload source unpack failed"))]
    Upload { source: upload::Error },
    #[snafu(display("configMaps source unpack failed"))]
    ConfigMaps { source: configmaps::Error },
    #[snafu(display("local source unpack failed"))]
    Local { source: local::Error },
    #[snafu(display("ociArtifact source unpack failed"))]
    OciArtifact { source: oci::Error },
}

pub type Result<T, E = UnpackError> = std::result::Result<T, E>;

/// Per-turn context threaded through every unpacker implementation.
#[derive(Clone)]
pub struct UnpackCtx {
    pub kube_client: KubeClient,
    pub http_client: reqwest::Client,
    pub system_namespace: String,
    pub unpack_helper_image: String,
    pub content_store: ContentStore,
    /// Bound to the reconciler's per-turn deadline.
    pub turn_deadline: Duration,
    /// Base URL of the upload-manager service, consulted by the upload
    /// unpacker variant.
    pub upload_manager_base_url: String,
    /// Path to this process's own service-account token, re-read on every
    /// use since Kubernetes rotates projected tokens in place.
    pub service_account_token_path: PathBuf,
}

#[async_trait]
pub trait Unpacker: Send + Sync {
    async fn unpack(&self, ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult>;

    /// Invoked by the `cleanup-unpack-cache` finalizer on
    /// `BundleDeployment` deletion. Most variants have nothing to clean up;
    /// the image/oci variants kill a residual unpack pod.
    async fn cleanup(&self, _ctx: &UnpackCtx, _bundle: &Bundle) -> Result<()> {
        Ok(())
    }
}

/// Maps [`SourceKind`] to its [`Unpacker`]. Unknown kinds (there are none
/// today, but the mapping is total by construction) yield
/// [`UnpackError::UnsupportedSourceType`].
pub struct CompositeUnpacker {
    unpackers: HashMap<SourceKind, Box<dyn Unpacker>>,
}

impl CompositeUnpacker {
    pub fn new() -> Self {
        let mut unpackers: HashMap<SourceKind, Box<dyn Unpacker>> = HashMap::new();
        unpackers.insert(SourceKind::Image, Box::new(image::ImageUnpacker));
        unpackers.insert(SourceKind::Git, Box::new(git::GitUnpacker));
        unpackers.insert(SourceKind::Http, Box::new(http::HttpUnpacker));
        unpackers.insert(SourceKind::Upload, Box::new(upload::UploadUnpacker));
        unpackers.insert(
            SourceKind::ConfigMaps,
            Box::new(configmaps::ConfigMapsUnpacker),
        );
        unpackers.insert(SourceKind::Local, Box::new(local::LocalUnpacker));
        unpackers.insert(SourceKind::OciArtifact, Box::new(oci::OciArtifactUnpacker));
        Self { unpackers }
    }

    pub async fn unpack(&self, ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
        let kind = bundle.spec.source.kind;
        let unpacker = self
            .unpackers
            .get(&kind)
            .context(UnsupportedSourceTypeSnafu { kind })?;
        unpacker.unpack(ctx, bundle).await
    }

    pub async fn cleanup(&self, ctx: &UnpackCtx, bundle: &Bundle) -> Result<()> {
        let kind = bundle.spec.source.kind;
        if let Some(unpacker) = self.unpackers.get(&kind) {
            unpacker.cleanup(ctx, bundle).await?;
        }
        Ok(())
    }
}

impl Default for CompositeUnpacker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_result_pending_carries_no_tree() {
        let result = UnpackResult::pending("waiting");
        assert_eq!(result.state, UnpackState::Pending);
        assert!(result.tree.is_none());
        assert!(result.resolved_source.is_none());
    }
}
