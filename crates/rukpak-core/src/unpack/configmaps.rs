//! ConfigMaps source: reads a declared list of (configmap, target subpath)
//! pairs into the synthetic tree. Every referenced configmap must be
//! immutable; no two entries may resolve to the same destination path.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use rukpak_crd::{Bundle, ResolvedSource, SourceKind};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::tree::FileTree;
use crate::unpack::{UnpackCtx, UnpackResult, Unpacker};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("bundle source is missing the configMaps configuration block"))]
    MissingConfig,
    #[snafu(display("configMaps entry is missing a configMap name"))]
    MissingConfigMapName,
    #[snafu(display("failed to look up configMap {name}"))]
    FetchConfigMap { name: String, source: kube::Error },
    #[snafu(display("configMap {name} is not immutable; only immutable configMaps may be used as a bundle source"))]
    NotImmutable { name: String },
    #[snafu(display("merging configMap {name} into the tree failed"))]
    Merge { name: String, source: crate::tree::TreeError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct ConfigMapsUnpacker;

#[async_trait::async_trait]
impl Unpacker for ConfigMapsUnpacker {
    async fn unpack(
        &self,
        ctx: &UnpackCtx,
        bundle: &Bundle,
    ) -> crate::unpack::Result<UnpackResult> {
        unpack(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::ConfigMaps { source })
    }
}

async fn unpack(ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
    let config = bundle
        .spec
        .source
        .config_maps
        .as_ref()
        .context(MissingConfigSnafu)?;

    let namespace = bundle
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| ctx.system_namespace.clone());
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.kube_client.clone(), &namespace);

    let mut tree = FileTree::new();
    for entry in &config.config_maps {
        let name = entry
            .config_map
            .name
            .clone()
            .context(MissingConfigMapNameSnafu)?;

        let config_map = config_maps
            .get(&name)
            .await
            .context(FetchConfigMapSnafu { name: name.clone() })?;
        ensure!(
            config_map.immutable.unwrap_or(false),
            NotImmutableSnafu { name: name.clone() }
        );

        let mut entry_tree = FileTree::new();
        for (key, value) in config_map.data.unwrap_or_default() {
            entry_tree.insert(key, value.into_bytes());
        }
        for (key, value) in config_map.binary_data.unwrap_or_default() {
            entry_tree.insert(key, value.0);
        }

        tree.merge_under(&entry.path, &entry_tree)
            .context(MergeSnafu { name: name.clone() })?;
    }

    Ok(UnpackResult::unpacked(
        tree,
        ResolvedSource {
            kind: SourceKind::ConfigMaps,
            image: None,
            git: None,
            http: None,
            oci_artifact: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn merge_detects_overlapping_destinations() {
        let mut a = FileTree::new();
        a.insert("values.yaml", Bytes::from_static(b"a: 1"));

        let mut tree = FileTree::new();
        tree.merge_under("manifests", &a).unwrap();
        assert!(tree.merge_under("manifests", &a).is_err());
    }
}
