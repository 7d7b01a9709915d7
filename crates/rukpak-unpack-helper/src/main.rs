//! The binary copied into image/ociArtifact unpack pods.
//! Deliberately dependency-light: this binary runs *inside* the bundle
//! image, a filesystem this process does not control, so it avoids pulling
//! in the Kubernetes client stack that the rest of the workspace uses.
//!
//! `serve` walks the configured source directory once per request and
//! streams it back as a gzipped tar on a fixed port, matching what
//! `rukpak_core::unpack::image` fetches from the pod's IP at
//! `/bundle.tar.gz`.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use rukpak_core::tree::FileTree;

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Serve the manifest directory as a gzipped tar over HTTP.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Directory whose contents are streamed, rooted under `manifests/` in
    /// the resulting archive. Matches `pod_utils::UNPACK_SOURCE_DIR`.
    #[clap(long, env = "RUKPAK_UNPACK_SOURCE_DIR", default_value = "/manifests")]
    source_dir: PathBuf,

    /// Port to listen on. Matches `pod_utils::UNPACK_PORT`.
    #[clap(long, env = "RUKPAK_UNPACK_PORT", default_value_t = 8080)]
    port: u16,
}

#[derive(Clone)]
struct AppState {
    source_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let Command::Serve(args) = opts.cmd;

    let app = Router::new()
        .route("/bundle.tar.gz", get(serve_bundle))
        .with_state(AppState {
            source_dir: args.source_dir,
        });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, "streaming manifest directory");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind unpack-helper listening socket");
    axum::serve(listener, app)
        .await
        .expect("unpack-helper server exited unexpectedly");
}

async fn serve_bundle(State(state): State<AppState>) -> Response {
    match build_archive(&state.source_dir) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/gzip")],
            Body::from(bytes),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to build manifest archive");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn build_archive(source_dir: &Path) -> io::Result<Vec<u8>> {
    let mut tree = FileTree::new();
    let mut stack = vec![source_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound && dir == source_dir => {
                // An empty bundle image with no manifest directory at all
                // is a valid (if degenerate) plain bundle.
                continue;
            }
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(source_dir).unwrap();
                let data = std::fs::read(&path)?;
                tree.insert(
                    format!("manifests/{}", relative.to_string_lossy().replace('\\', "/")),
                    data,
                );
            }
        }
    }
    tree.to_tar_gz()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_an_archive_rooted_at_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), b"a: 1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.yaml"), b"b: 2").unwrap();

        let bytes = build_archive(dir.path()).unwrap();
        let tree = FileTree::from_tar_gz(&bytes).unwrap();

        let mut paths: Vec<_> = tree.paths().collect();
        paths.sort();
        assert_eq!(paths, vec!["manifests/a.yaml", "manifests/sub/b.yaml"]);
    }

    #[test]
    fn missing_source_dir_produces_an_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let bytes = build_archive(&missing).unwrap();
        let tree = FileTree::from_tar_gz(&bytes).unwrap();
        assert!(tree.is_empty());
    }
}
