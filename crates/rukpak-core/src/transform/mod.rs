//! Format-specific handlers: `plain` validates a flat manifest tree as-is;
//! `registry` converts an OLM-style bundle into a plain one and then runs
//! the same validation.

pub mod plain;
pub mod registry;

use rukpak_crd::BundleFormat;
use snafu::{ResultExt, Snafu};

use crate::tree::FileTree;

#[derive(Snafu, Debug)]
pub enum TransformError {
    #[snafu(display("plain format validation failed"))]
    Plain { source: plain::Error },
    #[snafu(display("registry format conversion failed"))]
    Registry { source: registry::Error },
}

pub type Result<T, E = TransformError> = std::result::Result<T, E>;

/// Per-turn configuration the transform needs beyond the tree itself.
pub struct TransformCtx {
    /// Namespaces the owning `BundleDeployment` targets; empty means
    /// cluster-wide (`AllNamespaces`).
    pub target_namespaces: Vec<String>,
    pub reject_empty_object_set: bool,
}

pub fn transform(format: BundleFormat, tree: FileTree, ctx: &TransformCtx) -> Result<FileTree> {
    let tree = match format {
        BundleFormat::Plain => tree,
        BundleFormat::Registry => registry::to_plain(tree, ctx).context(RegistrySnafu)?,
    };
    plain::validate(tree, ctx).context(PlainSnafu)
}
