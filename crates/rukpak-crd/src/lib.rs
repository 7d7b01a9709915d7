//! Custom resource types for the bundle-provisioning engine: `Bundle` and
//! `BundleDeployment`, plus the source taxonomy and condition helpers they
//! share.

pub mod bundle;
pub mod bundle_deployment;
pub mod conditions;
pub mod source;
pub mod validate;

pub use bundle::{Bundle, BundlePhase, BundleSpec, BundleStatus, FINALIZER_DELETE_CACHED_BUNDLE};
pub use bundle_deployment::{
    BundleDeployment, BundleDeploymentPhase, BundleDeploymentSpec, BundleDeploymentStatus,
    BundleTemplate, FINALIZER_CLEANUP_UNPACK_CACHE,
};
pub use source::{
    BundleFormat, BundleSource, ConfigMapSourceEntry, ConfigMapsSource, GitAuth, GitRef,
    GitSource, HttpSource, ImageSource, LocalSource, OciArtifactSource, ResolvedGitSource,
    ResolvedHttpSource, ResolvedImageSource, ResolvedOciArtifactSource, ResolvedSource,
    SourceKind, UploadSource,
};
pub use validate::{validate_name, validate_source, ValidationError};

pub const GROUP: &str = "rukpak.example.io";
pub const SYSTEM_NAMESPACE_DEFAULT: &str = "rukpak-system";

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn bundle_crd_round_trips_through_schema_generation() {
        let crd = Bundle::crd();
        assert_eq!(crd.spec.group, "rukpak.example.io");
    }

    #[test]
    fn bundle_deployment_crd_round_trips_through_schema_generation() {
        let crd = BundleDeployment::crd();
        assert_eq!(crd.spec.group, "rukpak.example.io");
    }

    #[test]
    fn source_requires_no_two_variants_by_construction_but_serde_allows_it_defensively() {
        // Admission is the real boundary; this just checks (de)serialization shape.
        let yaml = r#"
type: git
git:
  repository: https://git.example/o/r
  gitRef:
    branch: main
"#;
        let source: BundleSource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(source.kind, SourceKind::Git);
        assert!(source.git.is_some());
        assert!(source.image.is_none());
    }
}
