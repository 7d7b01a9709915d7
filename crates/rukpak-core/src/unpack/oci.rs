//! OCI-artifact source: analogous to the image unpacker — same helper-pod
//! flow, driven by an OCI artifact reference instead of a container image.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use rukpak_crd::{Bundle, ResolvedOciArtifactSource, ResolvedSource, SourceKind};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::pod_utils::{build_unpack_pod, unpack_pod_name, UNPACK_PORT};
use crate::tree::FileTree;
use crate::unpack::{UnpackCtx, UnpackResult, Unpacker};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("bundle source is missing the ociArtifact configuration block"))]
    MissingConfig,
    #[snafu(display("failed to build unpack pod spec"))]
    BuildPod {
        source: stackable_operator::builder::meta::Error,
    },
    #[snafu(display("failed to create or fetch unpack pod"))]
    ApplyPod { source: kube::Error },
    #[snafu(display("failed to delete unpack pod"))]
    DeletePod { source: kube::Error },
    #[snafu(display("failed to fetch logs from failed unpack pod"))]
    FetchLogs { source: kube::Error },
    #[snafu(display("pod entered unexpected phase {phase:?}"))]
    UnexpectedPhase { phase: Option<String> },
    #[snafu(display("unpack pod failed: {logs}"))]
    PodFailed { logs: String },
    #[snafu(display("failed to fetch archive from unpack pod at {addr}"))]
    FetchArchive { source: reqwest::Error, addr: String },
    #[snafu(display("failed to read fetched archive"))]
    ReadArchive { source: crate::tree::TreeError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct OciArtifactUnpacker;

#[async_trait::async_trait]
impl Unpacker for OciArtifactUnpacker {
    async fn unpack(
        &self,
        ctx: &UnpackCtx,
        bundle: &Bundle,
    ) -> crate::unpack::Result<UnpackResult> {
        unpack(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::OciArtifact { source })
    }

    async fn cleanup(&self, ctx: &UnpackCtx, bundle: &Bundle) -> crate::unpack::Result<()> {
        delete_pod(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::OciArtifact { source })
    }
}

async fn unpack(ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
    let oci = bundle
        .spec
        .source
        .oci_artifact
        .as_ref()
        .context(MissingConfigSnafu)?;

    let pods: Api<Pod> = Api::namespaced(ctx.kube_client.clone(), &ctx.system_namespace);
    let pod_name = unpack_pod_name(bundle);

    let pod = match pods.get_opt(&pod_name).await.context(ApplyPodSnafu)? {
        Some(pod) => pod,
        None => {
            let desired = build_unpack_pod(
                bundle,
                &ctx.system_namespace,
                &ctx.unpack_helper_image,
                &oci.ref_,
            )
            .context(BuildPodSnafu)?;
            pods.create(&PostParams::default(), &desired)
                .await
                .context(ApplyPodSnafu)?
        }
    };

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();

    match phase.as_str() {
        "Pending" => Ok(UnpackResult::pending("waiting for artifact pull")),
        "Running" | "Succeeded" => fetch_from_running_pod(ctx, &pods, &pod, &pod_name).await,
        "Failed" => {
            let logs = pods
                .logs(&pod_name, &Default::default())
                .await
                .context(FetchLogsSnafu)?;
            let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
            PodFailedSnafu { logs }.fail()
        }
        other => {
            let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
            UnexpectedPhaseSnafu {
                phase: Some(other.to_string()),
            }
            .fail()
        }
    }
}

async fn fetch_from_running_pod(
    ctx: &UnpackCtx,
    pods: &Api<Pod>,
    pod: &Pod,
    pod_name: &str,
) -> Result<UnpackResult> {
    let pod_ip = match pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
        Some(ip) => ip,
        None => return Ok(UnpackResult::unpacking("waiting for pod IP assignment")),
    };

    let digest = match container_artifact_digest(pod) {
        Some(d) => d,
        None => return Ok(UnpackResult::unpacking("waiting for artifact digest resolution")),
    };

    let url = format!("http://{pod_ip}:{UNPACK_PORT}/bundle.tar.gz");
    let response = ctx
        .http_client
        .get(&url)
        .send()
        .await
        .context(FetchArchiveSnafu { addr: url.clone() })?;

    if !response.status().is_success() {
        return Ok(UnpackResult::unpacking(format!(
            "waiting for unpack server to become ready ({})",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .context(FetchArchiveSnafu { addr: url })?;
    let tree = FileTree::from_tar_gz(&bytes).context(ReadArchiveSnafu)?;

    let _ = pods.delete(pod_name, &DeleteParams::default()).await;

    Ok(UnpackResult::unpacked(
        tree,
        ResolvedSource {
            kind: SourceKind::OciArtifact,
            oci_artifact: Some(ResolvedOciArtifactSource { ref_: digest }),
            image: None,
            git: None,
            http: None,
        },
    ))
}

fn container_artifact_digest(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == "unpack")
        .and_then(|cs| cs.image_id.clone().or_else(|| Some(cs.image.clone())))
        .filter(|s| !s.is_empty())
}

async fn delete_pod(ctx: &UnpackCtx, bundle: &Bundle) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(ctx.kube_client.clone(), &ctx.system_namespace);
    let pod_name = unpack_pod_name(bundle);
    match pods.delete(&pod_name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(source) => Err(Error::DeletePod { source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn pod_with_container_status(status: ContainerStatus) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![status]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn base_container_status() -> ContainerStatus {
        ContainerStatus {
            name: "unpack".to_string(),
            ready: false,
            restart_count: 0,
            image: "example.com/artifact:latest".to_string(),
            image_id: String::new(),
            started: None,
            state: None,
            last_state: None,
        }
    }

    #[test]
    fn container_artifact_digest_prefers_image_id() {
        let mut status = base_container_status();
        status.image_id = "example.com/artifact@sha256:abc".to_string();
        let pod = pod_with_container_status(status);
        assert_eq!(
            container_artifact_digest(&pod),
            Some("example.com/artifact@sha256:abc".to_string())
        );
    }

    #[test]
    fn container_artifact_digest_falls_back_to_image_when_image_id_empty() {
        let pod = pod_with_container_status(base_container_status());
        assert_eq!(
            container_artifact_digest(&pod),
            Some("example.com/artifact:latest".to_string())
        );
    }

    #[test]
    fn container_artifact_digest_none_without_matching_container() {
        let mut status = base_container_status();
        status.name = "copy-unpack-helper".to_string();
        let pod = pod_with_container_status(status);
        assert_eq!(container_artifact_digest(&pod), None);
    }
}
