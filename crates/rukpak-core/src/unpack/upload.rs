//! Upload source: does not fetch anything itself. It waits for the owning
//! `BundleDeployment`'s `UploadStatus` condition to go True, then downloads
//! the blob the client already pushed to the upload manager.

use kube::api::Api;
use kube::ResourceExt;
use rukpak_crd::{conditions, Bundle, BundleDeployment, ResolvedSource, SourceKind};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::tree::FileTree;
use crate::unpack::{UnpackCtx, UnpackResult, Unpacker};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("bundle has no owning BundleDeployment to read UploadStatus from"))]
    MissingOwningDeployment,
    #[snafu(display("failed to look up owning BundleDeployment {name}"))]
    FetchDeployment { name: String, source: kube::Error },
    #[snafu(display("failed to read this process's service account token at {path}"))]
    ReadToken { path: String, source: std::io::Error },
    #[snafu(display("failed to fetch upload blob from {url}"))]
    Fetch { url: String, source: reqwest::Error },
    #[snafu(display("upload manager at {url} returned {status}"))]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[snafu(display("failed to read response body from {url}"))]
    ReadBody { url: String, source: reqwest::Error },
    #[snafu(display("failed to extract uploaded archive from {url}"))]
    ExtractArchive {
        url: String,
        source: crate::tree::TreeError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct UploadUnpacker;

#[async_trait::async_trait]
impl Unpacker for UploadUnpacker {
    async fn unpack(
        &self,
        ctx: &UnpackCtx,
        bundle: &Bundle,
    ) -> crate::unpack::Result<UnpackResult> {
        unpack(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::Upload { source })
    }
}

async fn unpack(ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
    let owner_name = bundle
        .owner_references()
        .iter()
        .find(|owner| owner.kind == "BundleDeployment")
        .map(|owner| owner.name.clone())
        .context(MissingOwningDeploymentSnafu)?;

    let deployments: Api<BundleDeployment> = Api::all(ctx.kube_client.clone());
    let deployment = deployments
        .get(&owner_name)
        .await
        .context(FetchDeploymentSnafu {
            name: owner_name.clone(),
        })?;

    let status = deployment.status.unwrap_or_default();
    if !conditions::condition_is_true(&status.conditions, conditions::TYPE_UPLOAD_STATUS) {
        return Ok(UnpackResult::pending(
            "waiting for upload to be accepted by the upload manager",
        ));
    }

    let token = tokio::fs::read_to_string(&ctx.service_account_token_path)
        .await
        .with_context(|_| ReadTokenSnafu {
            path: ctx.service_account_token_path.display().to_string(),
        })?;

    let url = format!(
        "{}/uploads/{}.tgz",
        ctx.upload_manager_base_url.trim_end_matches('/'),
        owner_name
    );
    let response = ctx
        .http_client
        .get(&url)
        .bearer_auth(token.trim())
        .send()
        .await
        .context(FetchSnafu { url: url.clone() })?;

    match response.status() {
        reqwest::StatusCode::OK => {}
        reqwest::StatusCode::NOT_FOUND => {
            return Ok(UnpackResult::pending(format!(
                "upload blob not yet written at {url}"
            )))
        }
        status => {
            return UnexpectedStatusSnafu {
                url: url.clone(),
                status,
            }
            .fail()
        }
    }

    let bytes = response
        .bytes()
        .await
        .context(ReadBodySnafu { url: url.clone() })?;
    let tree = FileTree::from_tar_gz(&bytes).context(ExtractArchiveSnafu { url: url.clone() })?;

    Ok(UnpackResult::unpacked(
        tree,
        ResolvedSource {
            kind: SourceKind::Upload,
            image: None,
            git: None,
            http: None,
            oci_artifact: None,
        },
    ))
}
