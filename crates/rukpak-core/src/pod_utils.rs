//! Builds the deterministic unpack pod used by the image and OCI-artifact
//! source unpackers.
//!
//! The pod name is derived only from the bundle name so that two concurrent
//! reconciles (or a reconcile racing a drifted delete) converge on a single
//! pod via create-or-recreate rather than creating duplicates.

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use kube::ResourceExt;
use rukpak_crd::Bundle;
use sha2::{Digest, Sha256};
use stackable_operator::builder::meta::ObjectMetaBuilder;

pub const UNPACK_HELPER_VOLUME_NAME: &str = "unpack-bin";
pub const UNPACK_HELPER_MOUNT_PATH: &str = "/unpack-bin";
pub const UNPACK_HELPER_BIN_NAME: &str = "rukpak-unpack-helper";
pub const UNPACK_SOURCE_DIR: &str = "/manifests";
pub const UNPACK_PORT: u16 = 8080;
const MAX_POD_NAME_LEN: usize = 63;

/// `unpack-{bundle-name}`, truncated with a content hash suffix when the
/// bundle name would push the pod name past the Kubernetes 63-char limit.
pub fn unpack_pod_name(bundle: &Bundle) -> String {
    let bundle_name = bundle.name_any();
    let full = format!("unpack-{bundle_name}");
    if full.len() <= MAX_POD_NAME_LEN {
        return full;
    }
    let mut hasher = Sha256::new();
    hasher.update(bundle_name.as_bytes());
    let suffix = hex::encode(hasher.finalize())[..8].to_string();
    let budget = MAX_POD_NAME_LEN - "unpack-".len() - 1 - suffix.len();
    format!("unpack-{}-{}", &bundle_name[..budget.min(bundle_name.len())], suffix)
}

pub fn build_unpack_pod(
    bundle: &Bundle,
    system_namespace: &str,
    unpack_helper_image: &str,
    bundle_image: &str,
) -> Result<Pod, stackable_operator::builder::meta::Error> {
    let pod_name = unpack_pod_name(bundle);
    let metadata = ObjectMetaBuilder::new()
        .name(pod_name)
        .namespace(system_namespace)
        .ownerreference_from_resource(bundle, None, Some(true))?
        .with_label("rukpak.example.io/bundle-name", bundle.name_any())
        .build();

    let helper_volume = Volume {
        name: UNPACK_HELPER_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    let init_container = Container {
        name: "copy-unpack-helper".to_string(),
        image: Some(unpack_helper_image.to_string()),
        command: Some(vec![
            "cp".to_string(),
            format!("/usr/local/bin/{UNPACK_HELPER_BIN_NAME}"),
            format!("{UNPACK_HELPER_MOUNT_PATH}/{UNPACK_HELPER_BIN_NAME}"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: UNPACK_HELPER_VOLUME_NAME.to_string(),
            mount_path: UNPACK_HELPER_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let main_container = Container {
        name: "unpack".to_string(),
        image: Some(bundle_image.to_string()),
        command: Some(vec![
            format!("{UNPACK_HELPER_MOUNT_PATH}/{UNPACK_HELPER_BIN_NAME}"),
            "serve".to_string(),
        ]),
        env: Some(vec![
            EnvVar {
                name: "RUKPAK_UNPACK_SOURCE_DIR".to_string(),
                value: Some(UNPACK_SOURCE_DIR.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "RUKPAK_UNPACK_PORT".to_string(),
                value: Some(UNPACK_PORT.to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: UNPACK_HELPER_VOLUME_NAME.to_string(),
            mount_path: UNPACK_HELPER_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            read_only_root_filesystem: Some(false),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Pod {
        metadata,
        spec: Some(PodSpec {
            automount_service_account_token: Some(false),
            restart_policy: Some("Never".to_string()),
            init_containers: Some(vec![init_container]),
            containers: vec![main_container],
            volumes: Some(vec![helper_volume]),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn bundle_named(name: &str) -> Bundle {
        Bundle {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some("11111111-1111-1111-1111-111111111111".to_string()),
                ..Default::default()
            },
            spec: rukpak_crd::BundleSpec {
                provisioner_class_name: "core".to_string(),
                source: rukpak_crd::BundleSource::default(),
                format: rukpak_crd::BundleFormat::Plain,
            },
            status: None,
        }
    }

    #[test]
    fn pod_name_is_short_and_deterministic() {
        let bundle = bundle_named("my-bundle");
        assert_eq!(unpack_pod_name(&bundle), "unpack-my-bundle");
        assert_eq!(unpack_pod_name(&bundle), unpack_pod_name(&bundle));
    }

    #[test]
    fn pod_name_truncates_long_bundle_names() {
        let long_name = "a".repeat(80);
        let bundle = bundle_named(&long_name);
        let name = unpack_pod_name(&bundle);
        assert!(name.len() <= MAX_POD_NAME_LEN);
        assert!(name.starts_with("unpack-"));
    }
}
