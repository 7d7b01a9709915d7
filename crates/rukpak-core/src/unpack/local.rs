//! Local source: resolves a single in-cluster object reference directly
//! into the tree. Analogous to the configMaps variant but for a single,
//! unprefixed reference rather than a composed list.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use rukpak_crd::{Bundle, ResolvedSource, SourceKind};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::tree::FileTree;
use crate::unpack::{UnpackCtx, UnpackResult, Unpacker};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("bundle source is missing the local configuration block"))]
    MissingConfig,
    #[snafu(display("local source references unsupported object kind {kind}"))]
    UnsupportedKind { kind: String },
    #[snafu(display("local source reference is missing a name"))]
    MissingName,
    #[snafu(display("failed to look up configMap {name}"))]
    FetchConfigMap { name: String, source: kube::Error },
    #[snafu(display("configMap {name} is not immutable; only immutable configMaps may be used as a bundle source"))]
    NotImmutable { name: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct LocalUnpacker;

#[async_trait::async_trait]
impl Unpacker for LocalUnpacker {
    async fn unpack(
        &self,
        ctx: &UnpackCtx,
        bundle: &Bundle,
    ) -> crate::unpack::Result<UnpackResult> {
        unpack(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::Local { source })
    }
}

async fn unpack(ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
    let local = bundle.spec.source.local.as_ref().context(MissingConfigSnafu)?;
    let source_ref = &local.source_ref;

    let kind = source_ref.kind.clone().unwrap_or_default();
    ensure!(kind == "ConfigMap", UnsupportedKindSnafu { kind });

    let name = source_ref.name.clone().context(MissingNameSnafu)?;
    let namespace = source_ref
        .namespace
        .clone()
        .or_else(|| bundle.metadata.namespace.clone())
        .unwrap_or_else(|| ctx.system_namespace.clone());

    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.kube_client.clone(), &namespace);
    let config_map = config_maps
        .get(&name)
        .await
        .context(FetchConfigMapSnafu { name: name.clone() })?;
    ensure!(
        config_map.immutable.unwrap_or(false),
        NotImmutableSnafu { name: name.clone() }
    );

    let mut tree = FileTree::new();
    for (key, value) in config_map.data.unwrap_or_default() {
        tree.insert(key, value.into_bytes());
    }
    for (key, value) in config_map.binary_data.unwrap_or_default() {
        tree.insert(key, value.0);
    }

    Ok(UnpackResult::unpacked(
        tree,
        ResolvedSource {
            kind: SourceKind::Local,
            image: None,
            git: None,
            http: None,
            oci_artifact: None,
        },
    ))
}
