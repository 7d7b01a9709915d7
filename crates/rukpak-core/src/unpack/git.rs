//! Git source: shallow-clones a repository at the configured
//! branch/tag/commit into an in-memory tree using `git2`.

use std::path::Path;

use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks};
use k8s_openapi::ByteString;
use kube::api::Api;
use rukpak_crd::{Bundle, GitRef, ResolvedGitSource, ResolvedSource, SourceKind};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::tree::{validate_relative_path, FileTree};
use crate::unpack::{UnpackCtx, UnpackResult, Unpacker};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("bundle source is missing the git configuration block"))]
    MissingConfig,
    #[snafu(display("at most one of branch/tag may be set"))]
    BranchAndTagBothSet,
    #[snafu(display("subdirectory {directory:?} escapes the repository root"))]
    InvalidSubdirectory {
        directory: String,
        source: crate::tree::TreeError,
    },
    #[snafu(display("failed to look up git auth secret"))]
    FetchAuthSecret { source: kube::Error },
    #[snafu(display("auth secret is missing key {key}"))]
    MissingSecretKey { key: String },
    #[snafu(display("failed to create clone scratch directory"))]
    ScratchDir { source: std::io::Error },
    #[snafu(display("failed to clone repository {repository}"))]
    Clone {
        repository: String,
        source: git2::Error,
    },
    #[snafu(display("failed to reset to commit {commit}"))]
    ResetToCommit { commit: String, source: git2::Error },
    #[snafu(display("failed to resolve HEAD commit"))]
    ResolveHead { source: git2::Error },
    #[snafu(display("failed to read cloned tree"))]
    ReadTree { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct GitUnpacker;

#[async_trait::async_trait]
impl Unpacker for GitUnpacker {
    async fn unpack(
        &self,
        ctx: &UnpackCtx,
        bundle: &Bundle,
    ) -> crate::unpack::Result<UnpackResult> {
        unpack(ctx, bundle)
            .await
            .map_err(|source| crate::unpack::UnpackError::Git { source })
    }
}

async fn unpack(ctx: &UnpackCtx, bundle: &Bundle) -> Result<UnpackResult> {
    let git = bundle.spec.source.git.as_ref().context(MissingConfigSnafu)?;
    ensure!(
        !(git.git_ref.branch.is_some() && git.git_ref.tag.is_some()),
        BranchAndTagBothSetSnafu
    );

    if let Some(directory) = &git.directory {
        validate_relative_path(directory).context(InvalidSubdirectorySnafu {
            directory: directory.clone(),
        })?;
    }

    let credentials = match &git.auth {
        Some(auth) => match auth.secret.as_ref() {
            Some(secret_ref) => {
                let secret_name = secret_ref.name.clone().unwrap_or_default();
                let mut creds = resolve_auth(ctx, bundle, &secret_name).await?;
                creds.insecure_accept_host_key = auth.insecure_skip_verify;
                Some(creds)
            }
            None => None,
        },
        None => None,
    };

    let repository = git.repository.clone();
    let git_ref = git.git_ref.clone();
    let scratch = tempfile::tempdir().context(ScratchDirSnafu)?;
    let scratch_path = scratch.path().to_path_buf();

    let (commit, tree) = tokio::task::spawn_blocking(move || {
        clone_and_read(&repository, &git_ref, credentials.as_ref(), &scratch_path)
    })
    .await
    .expect("git clone task panicked")?;

    let rooted = match &git.directory {
        Some(directory) => tree.subtree(directory),
        None => tree,
    };

    Ok(UnpackResult::unpacked(
        rooted,
        ResolvedSource {
            kind: SourceKind::Git,
            git: Some(ResolvedGitSource {
                repository: git.repository.clone(),
                commit,
            }),
            image: None,
            http: None,
            oci_artifact: None,
        },
    ))
}

struct Credentials {
    username: String,
    password: Option<String>,
    ssh_private_key: Option<String>,
    ssh_known_hosts: Option<String>,
    insecure_accept_host_key: bool,
}

async fn resolve_auth(
    ctx: &UnpackCtx,
    bundle: &Bundle,
    secret_name: &str,
) -> Result<Credentials> {
    let namespace = bundle
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| ctx.system_namespace.clone());
    let secrets: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.kube_client.clone(), &namespace);
    let secret = secrets.get(secret_name).await.context(FetchAuthSecretSnafu)?;
    let data = secret.data.unwrap_or_default();

    let get = |key: &str| -> Option<String> {
        data.get(key)
            .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
    };

    Ok(Credentials {
        username: get("username").unwrap_or_default(),
        password: get("password"),
        ssh_private_key: get("ssh-privatekey"),
        ssh_known_hosts: get("ssh-knownhosts"),
        insecure_accept_host_key: false,
    })
}

fn clone_and_read(
    repository: &str,
    git_ref: &GitRef,
    credentials: Option<&Credentials>,
    scratch: &Path,
) -> Result<(String, FileTree)> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(creds) = credentials {
        let is_http = repository.starts_with("http://") || repository.starts_with("https://");
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            if is_http {
                Cred::userpass_plaintext(
                    &creds.username,
                    creds.password.as_deref().unwrap_or(""),
                )
            } else if let Some(key) = &creds.ssh_private_key {
                Cred::ssh_key_from_memory(
                    username_from_url.unwrap_or("git"),
                    None,
                    key,
                    None,
                )
            } else {
                Cred::default()
            }
        });
        if creds.insecure_accept_host_key || creds.ssh_known_hosts.is_none() {
            callbacks.certificate_check(|_cert, _host| Ok(git2::CertificateCheckStatus::CertificateOk));
        }
    }

    let mut fetch_options = FetchOptions::new();
    fetch_options.depth(1);
    fetch_options.remote_callbacks(callbacks);

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if let Some(branch) = &git_ref.branch {
        builder.branch(branch);
    } else if let Some(tag) = &git_ref.tag {
        builder.branch(&format!("refs/tags/{tag}"));
    }

    let repo = builder
        .clone(repository, scratch)
        .context(CloneSnafu {
            repository: repository.to_string(),
        })?;

    if let Some(commit) = &git_ref.commit {
        let oid = git2::Oid::from_str(commit).context(ResetToCommitSnafu {
            commit: commit.clone(),
        })?;
        let object = repo.find_object(oid, None).context(ResetToCommitSnafu {
            commit: commit.clone(),
        })?;
        repo.reset(&object, git2::ResetType::Hard, None)
            .context(ResetToCommitSnafu {
                commit: commit.clone(),
            })?;
    }

    let head_commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .context(ResolveHeadSnafu)?;
    let commit_hash = head_commit.id().to_string();

    let tree = read_worktree(scratch).context(ReadTreeSnafu)?;
    Ok((commit_hash, tree))
}

fn read_worktree(root: &Path) -> std::io::Result<FileTree> {
    let mut tree = FileTree::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                let data = std::fs::read(&path)?;
                tree.insert(relative.to_string_lossy().replace('\\', "/"), data);
            }
        }
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_and_tag_together_is_rejected() {
        use rukpak_crd::{validate_source, BundleSource, ValidationError};

        let source = BundleSource {
            kind: SourceKind::Git,
            git: Some(rukpak_crd::GitSource {
                repository: "https://git.example/o/r".to_string(),
                directory: None,
                auth: None,
                git_ref: GitRef {
                    branch: Some("main".to_string()),
                    tag: Some("v1".to_string()),
                    commit: None,
                },
            }),
            ..Default::default()
        };

        assert_eq!(
            validate_source(&source),
            Err(ValidationError::ConflictingGitRef)
        );
    }

    #[test]
    fn read_worktree_skips_git_dir_and_reads_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref: refs/heads/main").unwrap();
        std::fs::create_dir_all(dir.path().join("manifests")).unwrap();
        std::fs::write(dir.path().join("manifests/deployment.yaml"), b"kind: Deployment").unwrap();
        std::fs::write(dir.path().join("README.md"), b"hello").unwrap();

        let tree = read_worktree(dir.path()).unwrap();

        assert_eq!(
            tree.get("manifests/deployment.yaml"),
            Some(&bytes::Bytes::from_static(b"kind: Deployment"))
        );
        assert_eq!(tree.get("README.md"), Some(&bytes::Bytes::from_static(b"hello")));
        assert!(tree.get(".git/HEAD").is_none());
    }
}
