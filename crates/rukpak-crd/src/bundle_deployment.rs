use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::source::{BundleFormat, BundleSource};

pub const FINALIZER_CLEANUP_UNPACK_CACHE: &str = "rukpak.example.io/cleanup-unpack-cache";

/// A declaration that a `Bundle`'s content should be rendered and kept
/// applied to the cluster. Cluster-scoped, see `Bundle`'s doc comment.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "rukpak.example.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    shortname = "bdep",
    status = "BundleDeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    pub provisioner_class_name: String,
    /// Template for the `Bundle` that is generated to track this source.
    /// The generated bundle's name is derived from this deployment's name
    /// plus a hash of this template, so a template change pivots to a
    /// freshly named bundle instead of mutating the old one in place.
    pub template: BundleTemplate,
    pub install_namespace: String,
    /// Pauses the deployment's pivot/apply cycle while leaving bundle
    /// resolution running.
    #[serde(default)]
    pub paused: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleTemplate {
    pub provisioner_class_name: String,
    pub source: BundleSource,
    #[serde(default)]
    pub format: BundleFormat,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default)]
    pub phase: BundleDeploymentPhase,
    /// Name of the `Bundle` currently materialized into the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_bundle: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum BundleDeploymentPhase {
    #[default]
    Pending,
    Unpacking,
    Unpacked,
    Installing,
    Installed,
    Failing,
}
