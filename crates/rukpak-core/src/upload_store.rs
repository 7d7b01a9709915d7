//! The upload intake's local blob store: `{root}/{bundle-name}.tgz`.
//!
//! Deliberately parallel to [`crate::store::ContentStore`] but keyed by
//! `BundleDeployment` name rather than UID, since a client that hasn't yet
//! created a successful upload has no UID to address by — the deployment
//! name is the only stable handle it has before the upload exists.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use snafu::{ResultExt, Snafu};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Snafu, Debug)]
pub enum UploadStoreError {
    #[snafu(display("failed to create storage root {path:?}"))]
    CreateRoot { source: io::Error, path: PathBuf },
    #[snafu(display("failed to write temporary blob {path:?}"))]
    WriteTemp { source: io::Error, path: PathBuf },
    #[snafu(display("failed to rename temporary blob into place"))]
    Rename { source: io::Error },
    #[snafu(display("failed to read blob {path:?}"))]
    Read { source: io::Error, path: PathBuf },
    #[snafu(display("failed to remove blob {path:?}"))]
    RemoveFile { source: io::Error, path: PathBuf },
    #[snafu(display("failed to list storage root {path:?}"))]
    ListRoot { source: io::Error, path: PathBuf },
}

pub type Result<T, E = UploadStoreError> = std::result::Result<T, E>;

#[derive(Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, deployment_name: &str) -> PathBuf {
        self.root.join(format!("{deployment_name}.tgz"))
    }

    pub async fn load(&self, deployment_name: &str) -> Result<Bytes> {
        let path = self.blob_path(deployment_name);
        let bytes = fs::read(&path).await.with_context(|_| ReadSnafu {
            path: path.clone(),
        })?;
        Ok(Bytes::from(bytes))
    }

    pub async fn exists(&self, deployment_name: &str) -> bool {
        fs::metadata(self.blob_path(deployment_name)).await.is_ok()
    }

    /// Atomically writes `bytes` to `{root}/{deployment_name}.tgz` the same
    /// way [`crate::store::ContentStore::store`] does: write-to-temp then
    /// rename, so a concurrent `load` never observes a partial write.
    pub async fn store(&self, deployment_name: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|_| CreateRootSnafu {
                path: self.root.clone(),
            })?;

        let tmp_path = self
            .root
            .join(format!(".{deployment_name}-{}.tgz.tmp", Uuid::new_v4()));
        {
            let mut file =
                fs::File::create(&tmp_path)
                    .await
                    .with_context(|_| WriteTempSnafu {
                        path: tmp_path.clone(),
                    })?;
            file.write_all(bytes)
                .await
                .with_context(|_| WriteTempSnafu {
                    path: tmp_path.clone(),
                })?;
            file.flush().await.with_context(|_| WriteTempSnafu {
                path: tmp_path.clone(),
            })?;
        }

        fs::rename(&tmp_path, self.blob_path(deployment_name))
            .await
            .context(RenameSnafu)
    }

    pub async fn delete(&self, deployment_name: &str) -> Result<()> {
        let path = self.blob_path(deployment_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|_| RemoveFileSnafu { path }),
        }
    }

    /// Names (without the `.tgz` suffix) of every blob currently on disk,
    /// used by the orphan-upload GC loop.
    pub async fn list_deployment_names(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|_| ListRootSnafu {
                    path: self.root.clone(),
                })
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|_| ListRootSnafu {
                path: self.root.clone(),
            })?
        {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(".tgz") {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());

        store.store("demo", b"hello").await.unwrap();
        assert!(store.exists("demo").await);
        assert_eq!(store.load("demo").await.unwrap(), Bytes::from_static(b"hello"));

        store.delete("demo").await.unwrap();
        assert!(!store.exists("demo").await);
        store.delete("demo").await.unwrap();
    }

    #[tokio::test]
    async fn list_deployment_names_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        store.store("a", b"1").await.unwrap();
        store.store("b", b"2").await.unwrap();

        let mut names = store.list_deployment_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("does-not-exist"));
        assert_eq!(store.list_deployment_names().await.unwrap(), Vec::<String>::new());
    }
}
