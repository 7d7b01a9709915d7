//! Plain-format transform: the tree is manifests as-is. Validates that
//! `manifests/` is flat (no subdirectories) and, when configured, that it
//! isn't empty.

use snafu::{ensure, Snafu};

use crate::tree::FileTree;
use crate::transform::TransformCtx;

pub const MANIFESTS_ROOT: &str = "manifests";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display(
        "manifest directory contains a subdirectory below {root}/; plain bundles must be flat"
    ))]
    NotFlat { root: String },
    #[snafu(display("bundle contains no manifest objects under {root}/"))]
    EmptyObjectSet { root: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn validate(tree: FileTree, ctx: &TransformCtx) -> Result<FileTree> {
    ensure!(
        !tree.has_nested_manifests(MANIFESTS_ROOT),
        NotFlatSnafu {
            root: MANIFESTS_ROOT.to_string()
        }
    );

    if ctx.reject_empty_object_set {
        let prefix = format!("{MANIFESTS_ROOT}/");
        let has_manifest = tree.paths().any(|p| p.starts_with(&prefix));
        ensure!(
            has_manifest,
            EmptyObjectSetSnafu {
                root: MANIFESTS_ROOT.to_string()
            }
        );
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ctx(reject_empty: bool) -> TransformCtx {
        TransformCtx {
            target_namespaces: vec![],
            reject_empty_object_set: reject_empty,
        }
    }

    #[test]
    fn flat_manifests_pass() {
        let mut tree = FileTree::new();
        tree.insert("manifests/a.yaml", Bytes::from_static(b"a: 1"));
        assert!(validate(tree, &ctx(false)).is_ok());
    }

    #[test]
    fn nested_manifests_are_rejected() {
        let mut tree = FileTree::new();
        tree.insert("manifests/sub/a.yaml", Bytes::from_static(b"a: 1"));
        assert!(matches!(validate(tree, &ctx(false)), Err(Error::NotFlat { .. })));
    }

    #[test]
    fn empty_object_set_rejected_when_configured() {
        let tree = FileTree::new();
        assert!(matches!(
            validate(tree, &ctx(true)),
            Err(Error::EmptyObjectSet { .. })
        ));
    }

    #[test]
    fn empty_object_set_allowed_by_default() {
        let tree = FileTree::new();
        assert!(validate(tree, &ctx(false)).is_ok());
    }
}
