//! Registry-format transform: converts an OLM-style bundle (a
//! `ClusterServiceVersion` plus its owned CRDs) into a flat plain-format
//! manifest set, validating install-mode compatibility with the configured
//! target namespaces along the way.
//!
//! Synthesized object names are derived from the CSV name via a stable
//! hash, so repeated conversions of the same bundle produce identical
//! names (scenario 6's "deterministic names").

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::collections::{BTreeMap, BTreeSet};

use crate::transform::plain::MANIFESTS_ROOT;
use crate::transform::TransformCtx;
use crate::tree::FileTree;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("registry bundle contains no clusterserviceversion manifest"))]
    MissingCsv,
    #[snafu(display("failed to parse clusterserviceversion manifest"))]
    ParseCsv { source: serde_yaml::Error },
    #[snafu(display(
        "install modes {modes:?} are not compatible with target namespaces {targets:?}"
    ))]
    UnsupportedInstallMode {
        modes: Vec<String>,
        targets: Vec<String>,
    },
    #[snafu(display("failed to render synthesized object {name}"))]
    RenderObject { name: String, source: serde_yaml::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Csv {
    metadata: CsvMetadata,
    spec: CsvSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct CsvMetadata {
    name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvSpec {
    install: CsvInstall,
    #[serde(default)]
    install_modes: Vec<CsvInstallMode>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvInstall {
    #[serde(default)]
    spec: CsvInstallSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvInstallSpec {
    #[serde(default)]
    deployments: Vec<CsvDeploymentSpec>,
    #[serde(default)]
    permissions: Vec<CsvPermission>,
    #[serde(default)]
    cluster_permissions: Vec<CsvPermission>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvDeploymentSpec {
    name: String,
    spec: DeploymentSpec,
    #[serde(default)]
    label: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvPermission {
    service_account_name: String,
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvInstallMode {
    #[serde(rename = "type")]
    kind: InstallModeType,
    supported: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
enum InstallModeType {
    OwnNamespace,
    SingleNamespace,
    MultiNamespace,
    AllNamespaces,
}

pub fn to_plain(tree: FileTree, ctx: &TransformCtx) -> Result<FileTree> {
    let csv = find_csv(&tree)?;
    validate_install_modes(&csv.spec.install_modes, &ctx.target_namespaces)?;

    let mut out = FileTree::new();
    for (path, data) in tree.iter() {
        if !path.ends_with(".clusterserviceversion.yaml") {
            out.insert(path.to_string(), data.clone());
        }
    }

    for dep in &csv.spec.install.spec.deployments {
        let name = stable_name(&csv.metadata.name, &dep.name);
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(dep.label.clone()),
                ..Default::default()
            },
            spec: Some(dep.spec.clone()),
            status: None,
        };
        insert_object(&mut out, &format!("{name}.deployment.yaml"), &deployment)?;
    }

    let mut service_accounts = BTreeSet::new();
    let default_namespace = ctx.target_namespaces.first().cloned();

    for perm in &csv.spec.install.spec.permissions {
        service_accounts.insert(perm.service_account_name.clone());
        let role_name = stable_name(&csv.metadata.name, &perm.service_account_name);
        insert_role_and_binding(
            &mut out,
            &role_name,
            &perm.service_account_name,
            &perm.rules,
            default_namespace.clone(),
        )?;
    }

    for perm in &csv.spec.install.spec.cluster_permissions {
        service_accounts.insert(perm.service_account_name.clone());
        let role_name = stable_name(
            &csv.metadata.name,
            &format!("cluster-{}", perm.service_account_name),
        );
        insert_cluster_role_and_binding(
            &mut out,
            &role_name,
            &perm.service_account_name,
            &perm.rules,
            default_namespace.clone(),
        )?;
    }

    for sa_name in service_accounts {
        insert_service_account(&mut out, &sa_name)?;
    }

    Ok(out)
}

fn validate_install_modes(modes: &[CsvInstallMode], target_namespaces: &[String]) -> Result<()> {
    let supported: Vec<InstallModeType> = modes
        .iter()
        .filter(|m| m.supported)
        .map(|m| m.kind)
        .collect();

    let compatible = match target_namespaces.len() {
        0 => supported.contains(&InstallModeType::AllNamespaces),
        1 => {
            supported.contains(&InstallModeType::OwnNamespace)
                || supported.contains(&InstallModeType::SingleNamespace)
                || supported.contains(&InstallModeType::AllNamespaces)
        }
        _ => {
            supported.contains(&InstallModeType::MultiNamespace)
                || supported.contains(&InstallModeType::AllNamespaces)
        }
    };

    ensure!(
        compatible,
        UnsupportedInstallModeSnafu {
            modes: supported.iter().map(|m| format!("{m:?}")).collect::<Vec<_>>(),
            targets: target_namespaces.to_vec(),
        }
    );
    Ok(())
}

fn find_csv(tree: &FileTree) -> Result<Csv> {
    let (_, bytes) = tree
        .iter()
        .find(|(path, _)| path.ends_with(".clusterserviceversion.yaml"))
        .context(MissingCsvSnafu)?;
    serde_yaml::from_slice(bytes).context(ParseCsvSnafu)
}

fn stable_name(csv_name: &str, part: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(csv_name.as_bytes());
    hasher.update(b"/");
    hasher.update(part.as_bytes());
    let suffix = hex::encode(hasher.finalize())[..8].to_string();
    format!("{part}-{suffix}")
}

fn insert_object<T: Serialize>(tree: &mut FileTree, filename: &str, object: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(object).with_context(|_| RenderObjectSnafu {
        name: filename.to_string(),
    })?;
    tree.insert(format!("{MANIFESTS_ROOT}/{filename}"), yaml.into_bytes());
    Ok(())
}

fn insert_service_account(tree: &mut FileTree, name: &str) -> Result<()> {
    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    insert_object(tree, &format!("{name}.serviceaccount.yaml"), &sa)
}

fn insert_role_and_binding(
    tree: &mut FileTree,
    role_name: &str,
    service_account_name: &str,
    rules: &[PolicyRule],
    namespace: Option<String>,
) -> Result<()> {
    let role = Role {
        metadata: ObjectMeta {
            name: Some(role_name.to_string()),
            ..Default::default()
        },
        rules: Some(rules.to_vec()),
    };
    insert_object(tree, &format!("{role_name}.role.yaml"), &role)?;

    let binding = RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_name.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name.to_string(),
            namespace,
            ..Default::default()
        }]),
    };
    insert_object(tree, &format!("{role_name}.rolebinding.yaml"), &binding)
}

fn insert_cluster_role_and_binding(
    tree: &mut FileTree,
    role_name: &str,
    service_account_name: &str,
    rules: &[PolicyRule],
    namespace: Option<String>,
) -> Result<()> {
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(role_name.to_string()),
            ..Default::default()
        },
        rules: Some(rules.to_vec()),
        ..Default::default()
    };
    insert_object(tree, &format!("{role_name}.clusterrole.yaml"), &role)?;

    let binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(role_name.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name.to_string(),
            namespace,
            ..Default::default()
        }]),
    };
    insert_object(
        tree,
        &format!("{role_name}.clusterrolebinding.yaml"),
        &binding,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_yaml(install_modes: &str) -> String {
        format!(
            r#"
metadata:
  name: demo-operator.v1.0.0
spec:
  installModes:
{install_modes}
  install:
    spec:
      deployments:
        - name: controller-manager
          spec:
            replicas: 1
            selector:
              matchLabels:
                app: demo
            template:
              metadata:
                labels:
                  app: demo
              spec:
                containers:
                  - name: manager
                    image: example.invalid/demo:v1.0.0
      permissions:
        - serviceAccountName: demo-sa
          rules:
            - apiGroups: [""]
              resources: ["configmaps"]
              verbs: ["get", "list"]
"#
        )
    }

    fn tree_with_csv(install_modes: &str) -> FileTree {
        let mut tree = FileTree::new();
        tree.insert(
            "manifests/demo.clusterserviceversion.yaml",
            csv_yaml(install_modes).into_bytes(),
        );
        tree
    }

    #[test]
    fn single_namespace_only_rejects_empty_targets() {
        let tree = tree_with_csv(
            "    - type: SingleNamespace\n      supported: true\n    - type: AllNamespaces\n      supported: false\n",
        );
        let ctx = TransformCtx {
            target_namespaces: vec![],
            reject_empty_object_set: false,
        };
        assert!(matches!(
            to_plain(tree, &ctx),
            Err(Error::UnsupportedInstallMode { .. })
        ));
    }

    #[test]
    fn single_namespace_accepts_one_target_and_synthesizes_objects() {
        let tree = tree_with_csv(
            "    - type: SingleNamespace\n      supported: true\n    - type: AllNamespaces\n      supported: false\n",
        );
        let ctx = TransformCtx {
            target_namespaces: vec!["demo-ns".to_string()],
            reject_empty_object_set: false,
        };
        let plain = to_plain(tree, &ctx).unwrap();
        assert!(plain
            .paths()
            .any(|p| p.contains("controller-manager") && p.ends_with(".deployment.yaml")));
        assert!(plain
            .paths()
            .any(|p| p.contains("demo-sa") && p.ends_with(".serviceaccount.yaml")));
        assert!(plain.paths().any(|p| p.ends_with(".role.yaml")));
        assert!(plain.paths().any(|p| p.ends_with(".rolebinding.yaml")));
    }

    #[test]
    fn synthesized_names_are_stable_across_conversions() {
        let ctx = TransformCtx {
            target_namespaces: vec!["demo-ns".to_string()],
            reject_empty_object_set: false,
        };
        let modes = "    - type: SingleNamespace\n      supported: true\n";
        let first = to_plain(tree_with_csv(modes), &ctx).unwrap();
        let second = to_plain(tree_with_csv(modes), &ctx).unwrap();
        assert_eq!(
            first.paths().collect::<Vec<_>>(),
            second.paths().collect::<Vec<_>>()
        );
    }
}
