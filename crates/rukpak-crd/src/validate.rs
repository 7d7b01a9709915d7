//! Admission-validation rules, factored out as a plain, unit-testable
//! function rather than a `ValidatingWebhookConfiguration` HTTP server.
//! Useful as a defensive, in-process check the reconcilers run before
//! acting on a spec an external validator should have already rejected.

use snafu::{ensure, OptionExt, Snafu};

use crate::source::{BundleSource, GitSource, SourceKind};

pub const MAX_NAME_LEN: usize = 40;

#[derive(Snafu, Debug, Eq, PartialEq)]
pub enum ValidationError {
    #[snafu(display("name {name:?} exceeds the {max}-character limit", max = MAX_NAME_LEN))]
    NameTooLong { name: String },
    #[snafu(display("source type {kind} requires its matching configuration block"))]
    MissingSourceConfig { kind: SourceKind },
    #[snafu(display("exactly one source configuration block may be populated, found {count}"))]
    MultipleSourceConfigs { count: usize },
    #[snafu(display("at most one of branch/tag may be set on a git source"))]
    ConflictingGitRef,
    #[snafu(display("git subdirectory must not begin with \"..\" or \"/\""))]
    GitSubdirectoryEscapesRoot,
    #[snafu(display("configMaps entry path {path:?} must be relative to the bundle root"))]
    ConfigMapPathEscapesRoot { path: String },
}

pub type Result<T, E = ValidationError> = std::result::Result<T, E>;

pub fn validate_name(name: &str) -> Result<()> {
    ensure!(
        name.chars().count() <= MAX_NAME_LEN,
        NameTooLongSnafu {
            name: name.to_string()
        }
    );
    Ok(())
}

/// Checks that exactly the block matching `source.kind` is populated, that
/// no other block is, and runs the per-variant structural rules.
pub fn validate_source(source: &BundleSource) -> Result<()> {
    let populated = [
        source.image.is_some(),
        source.git.is_some(),
        source.http.is_some(),
        source.upload.is_some(),
        source.config_maps.is_some(),
        source.local.is_some(),
        source.oci_artifact.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    ensure!(populated == 1, MultipleSourceConfigsSnafu { count: populated });

    match source.kind {
        SourceKind::Image => {
            source
                .image
                .as_ref()
                .context(MissingSourceConfigSnafu { kind: source.kind })?;
        }
        SourceKind::Git => {
            validate_git(source.git.as_ref().context(MissingSourceConfigSnafu {
                kind: source.kind,
            })?)?;
        }
        SourceKind::Http => {
            source
                .http
                .as_ref()
                .context(MissingSourceConfigSnafu { kind: source.kind })?;
        }
        SourceKind::Upload => {
            source
                .upload
                .as_ref()
                .context(MissingSourceConfigSnafu { kind: source.kind })?;
        }
        SourceKind::ConfigMaps => {
            let config_maps = source
                .config_maps
                .as_ref()
                .context(MissingSourceConfigSnafu { kind: source.kind })?;
            for entry in &config_maps.config_maps {
                ensure!(
                    !entry.path.starts_with("..") && !entry.path.starts_with('/'),
                    ConfigMapPathEscapesRootSnafu {
                        path: entry.path.clone()
                    }
                );
            }
        }
        SourceKind::Local => {
            source
                .local
                .as_ref()
                .context(MissingSourceConfigSnafu { kind: source.kind })?;
        }
        SourceKind::OciArtifact => {
            source
                .oci_artifact
                .as_ref()
                .context(MissingSourceConfigSnafu { kind: source.kind })?;
        }
    }
    Ok(())
}

fn validate_git(git: &GitSource) -> Result<()> {
    ensure!(
        !(git.git_ref.branch.is_some() && git.git_ref.tag.is_some()),
        ConflictingGitRefSnafu
    );
    if let Some(dir) = &git.directory {
        ensure!(
            !dir.starts_with("..") && !dir.starts_with('/'),
            GitSubdirectoryEscapesRootSnafu
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ConfigMapSourceEntry, ConfigMapsSource, GitRef, ImageSource};
    use k8s_openapi::api::core::v1::LocalObjectReference;

    fn git_source(branch: Option<&str>, tag: Option<&str>, directory: Option<&str>) -> BundleSource {
        BundleSource {
            kind: SourceKind::Git,
            git: Some(GitSource {
                repository: "https://git.example/o/r".to_string(),
                directory: directory.map(str::to_string),
                auth: None,
                git_ref: GitRef {
                    branch: branch.map(str::to_string),
                    tag: tag.map(str::to_string),
                    commit: None,
                },
            }),
            ..Default::default()
        }
    }

    #[test]
    fn name_within_limit_is_accepted() {
        assert!(validate_name("a-reasonably-short-name").is_ok());
    }

    #[test]
    fn name_over_limit_is_rejected() {
        assert_eq!(
            validate_name(&"a".repeat(41)),
            Err(ValidationError::NameTooLong { name: "a".repeat(41) })
        );
    }

    #[test]
    fn git_source_requires_exactly_one_of_branch_or_tag() {
        assert!(validate_source(&git_source(Some("main"), None, None)).is_ok());
        assert_eq!(
            validate_source(&git_source(Some("main"), Some("v1"), None)),
            Err(ValidationError::ConflictingGitRef)
        );
    }

    #[test]
    fn git_subdirectory_escaping_root_is_rejected() {
        assert_eq!(
            validate_source(&git_source(Some("main"), None, Some("../etc"))),
            Err(ValidationError::GitSubdirectoryEscapesRoot)
        );
    }

    #[test]
    fn image_source_without_its_block_is_rejected() {
        let source = BundleSource {
            kind: SourceKind::Image,
            ..Default::default()
        };
        assert_eq!(
            validate_source(&source),
            Err(ValidationError::MissingSourceConfig {
                kind: SourceKind::Image
            })
        );
    }

    #[test]
    fn more_than_one_populated_block_is_rejected() {
        let source = BundleSource {
            kind: SourceKind::Image,
            image: Some(ImageSource {
                ref_: "registry.example/bundle:latest".to_string(),
                pull_secret: None,
                insecure_skip_tls_verify: None,
            }),
            http: Some(crate::source::HttpSource {
                url: "https://example/bundle.tgz".to_string(),
                auth_secret: None,
                insecure_skip_tls_verify: false,
            }),
            ..Default::default()
        };
        assert_eq!(
            validate_source(&source),
            Err(ValidationError::MultipleSourceConfigs { count: 2 })
        );
    }

    #[test]
    fn config_map_path_escaping_root_is_rejected() {
        let source = BundleSource {
            kind: SourceKind::ConfigMaps,
            config_maps: Some(ConfigMapsSource {
                config_maps: vec![ConfigMapSourceEntry {
                    config_map: LocalObjectReference {
                        name: "manifests".to_string(),
                    },
                    path: "/etc/passwd".to_string(),
                }],
            }),
            ..Default::default()
        };
        assert_eq!(
            validate_source(&source),
            Err(ValidationError::ConfigMapPathEscapesRoot {
                path: "/etc/passwd".to_string()
            })
        );
    }
}
