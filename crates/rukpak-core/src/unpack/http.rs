//! HTTP source: streams a gzipped tar from a declared URL, with optional
//! basic auth resolved from a referenced secret and optional TLS
//! verification skip.

use k8s_openapi::ByteString;
use kube::api::Api;
use rukpak_crd::{Bundle, ResolvedHttpSource, ResolvedSource, SourceKind};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::tree::FileTree;
use crate::unpack::{UnpackCtx, UnpackResult, Unpacker};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("bundle source is missing the http configuration block"))]
    MissingConfig,
    #[snafu(display("failed to look up http auth secret"))]
    FetchAuthSecret { source: kube::Error },
    #[snafu(display("failed to build http client"))]
    BuildClient { source: reqwest::Error },
    #[snafu(display("failed to fetch {url}"))]
    Fetch { url: String, source: reqwest::Error },
    #[snafu(display("server at {url} returned {status}"))]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[snafu(display("failed to read response body from {url}"))]
    ReadBody { url: String, source: reqwest::Error },
    #[snafu(display("failed to extract archive from {url}"))]
    ExtractArchive {
        url: String,
        source: crate::tree::TreeError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct HttpUnpacker;

#[async_trait::async_trait]
impl Unpacker for HttpUnpacker {
    async fn unpack(
        &self,
        ctx: &UnpackCtx,
        bundle: &Bundle,
    ) -> crate::unpack::Result<UnpackResult> {
        unpack(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::Http { source })
    }
}

async fn unpack(ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
    let http = bundle.spec.source.http.as_ref().context(MissingConfigSnafu)?;

    let client = if http.insecure_skip_tls_verify {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context(BuildClientSnafu)?
    } else {
        ctx.http_client.clone()
    };

    let mut request = client.get(&http.url);
    if let Some(secret_ref) = &http.auth_secret {
        let namespace = bundle
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| ctx.system_namespace.clone());
        let secrets: Api<k8s_openapi::api::core::v1::Secret> =
            Api::namespaced(ctx.kube_client.clone(), &namespace);
        let secret_name = secret_ref.name.clone().unwrap_or_default();
        let secret = secrets
            .get(&secret_name)
            .await
            .context(FetchAuthSecretSnafu)?;
        let data = secret.data.unwrap_or_default();
        let get = |key: &str| -> String {
            data.get(key)
                .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default()
        };
        request = request.basic_auth(get("username"), Some(get("password")));
    }

    let response = request.send().await.context(FetchSnafu {
        url: http.url.clone(),
    })?;

    match response.status() {
        reqwest::StatusCode::OK => {}
        reqwest::StatusCode::NOT_FOUND => {
            return Ok(UnpackResult::pending(format!(
                "source not yet available at {}",
                http.url
            )))
        }
        status => {
            return UnexpectedStatusSnafu {
                url: http.url.clone(),
                status,
            }
            .fail()
        }
    }

    let bytes = response.bytes().await.context(ReadBodySnafu {
        url: http.url.clone(),
    })?;
    let tree = FileTree::from_tar_gz(&bytes).context(ExtractArchiveSnafu {
        url: http.url.clone(),
    })?;

    Ok(UnpackResult::unpacked(
        tree,
        ResolvedSource {
            kind: SourceKind::Http,
            http: Some(ResolvedHttpSource {
                url: http.url.clone(),
            }),
            image: None,
            git: None,
            oci_artifact: None,
        },
    ))
}
