use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::source::{BundleFormat, BundleSource, ResolvedSource};

pub const FINALIZER_DELETE_CACHED_BUNDLE: &str = "rukpak.example.io/delete-cached-bundle";

/// A named, versioned handle on externally-sourced manifest content.
///
/// Cluster-scoped: a `BundleDeployment` in any namespace can reference a
/// `Bundle` by name (mirrors upstream rukpak, see DESIGN.md open question).
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "rukpak.example.io",
    version = "v1alpha1",
    kind = "Bundle",
    shortname = "bd",
    status = "BundleStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Selects which `Bundle` reconciler (provisioner) handles this object.
    pub provisioner_class_name: String,
    pub source: BundleSource,
    #[serde(default)]
    pub format: BundleFormat,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub phase: BundlePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_source: Option<ResolvedSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
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
pub enum BundlePhase {
    #[default]
    Pending,
    Unpacking,
    Unpacked,
    Failing,
}
