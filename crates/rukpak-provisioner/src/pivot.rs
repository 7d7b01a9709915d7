//! Derives the name of the `Bundle` generated to track a
//! `BundleDeployment`'s source template.
//!
//! The name is `{deployment-name}-{hash(template)}`, truncated to fit the
//! Kubernetes 63-char name limit the same way [`rukpak_core::pod_utils`]
//! truncates pod names. A template change therefore always produces a
//! freshly named bundle, which is how pivoting is driven: the old bundle
//! is left in place (and its deployment) until the new one installs
//! successfully (see `deployment_controller::reconcile`).

use rukpak_crd::BundleTemplate;
use sha2::{Digest, Sha256};

const MAX_NAME_LEN: usize = 63;

pub fn generated_bundle_name(deployment_name: &str, template: &BundleTemplate) -> String {
    let hash = template_hash(template);
    let full = format!("{deployment_name}-{hash}");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }
    let budget = MAX_NAME_LEN - 1 - hash.len();
    format!("{}-{hash}", &deployment_name[..budget.min(deployment_name.len())])
}

/// Stable short hash of the template's serialized form. Any field change
/// (source, format, provisioner class) changes the hash and therefore the
/// generated bundle's name.
fn template_hash(template: &BundleTemplate) -> String {
    let canonical =
        serde_json::to_vec(template).expect("BundleTemplate serialization cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())[..10].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rukpak_crd::{BundleFormat, BundleSource, SourceKind, UploadSource};

    fn template(kind: SourceKind) -> BundleTemplate {
        let mut source = BundleSource {
            kind,
            ..Default::default()
        };
        if kind == SourceKind::Upload {
            source.upload = Some(UploadSource::default());
        }
        BundleTemplate {
            provisioner_class_name: "core".to_string(),
            source,
            format: BundleFormat::Plain,
        }
    }

    #[test]
    fn same_template_yields_same_name() {
        let t = template(SourceKind::Upload);
        assert_eq!(
            generated_bundle_name("my-deployment", &t),
            generated_bundle_name("my-deployment", &t)
        );
    }

    #[test]
    fn different_template_yields_different_name() {
        let a = generated_bundle_name("my-deployment", &template(SourceKind::Upload));
        let b = generated_bundle_name("my-deployment", &template(SourceKind::Image));
        assert_ne!(a, b);
    }

    #[test]
    fn long_deployment_names_are_truncated() {
        let name = generated_bundle_name(&"x".repeat(80), &template(SourceKind::Upload));
        assert!(name.len() <= MAX_NAME_LEN);
    }
}
