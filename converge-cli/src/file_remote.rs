//! Remote backed by a directory of wire bodies.
//!
//! Layout: `<root>/<resource>/<kind>.json`. A resource exists while its
//! `resource.json` does.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use converge_core::descriptor::wire;
use converge_core::{Mutation, RemoteError, StateMutator, StateSource, SubResourceKind};
use serde_json::Value;
use tracing::debug;

pub struct FileRemote {
    root: PathBuf,
}

impl FileRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resource_dir(&self, resource: &str) -> Result<PathBuf, RemoteError> {
        if resource.is_empty()
            || resource.starts_with('.')
            || resource.contains(['/', '\\'])
        {
            return Err(RemoteError::Permanent(format!(
                "invalid resource name {:?}",
                resource
            )));
        }
        Ok(self.root.join(resource))
    }

    fn body_path(dir: &Path, kind: SubResourceKind) -> PathBuf {
        dir.join(format!("{}.json", kind))
    }

    async fn read(path: &Path) -> Result<Option<Value>, RemoteError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                RemoteError::Permanent(format!("corrupt state file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn write(path: &Path, body: &Value) -> Result<(), RemoteError> {
        let text = serde_json::to_vec_pretty(body)
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> RemoteError {
    match e.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied => RemoteError::Auth(format!("{}: {}", path.display(), e)),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            RemoteError::Transient(format!("{}: {}", path.display(), e))
        }
        _ => RemoteError::Permanent(format!("{}: {}", path.display(), e)),
    }
}

#[async_trait]
impl StateSource for FileRemote {
    async fn fetch(&self, resource: &str, kind: SubResourceKind) -> Result<Value, RemoteError> {
        let dir = self.resource_dir(resource)?;
        let marker = Self::body_path(&dir, SubResourceKind::Resource);
        if !tokio::fs::try_exists(&marker)
            .await
            .map_err(|e| io_error(&marker, e))?
        {
            return Err(RemoteError::NotFound(format!("resource {}", resource)));
        }
        let path = Self::body_path(&dir, kind);
        Self::read(&path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("{} of {}", kind, resource)))
    }
}

#[async_trait]
impl StateMutator for FileRemote {
    async fn apply(
        &self,
        resource: &str,
        kind: SubResourceKind,
        mutation: &Mutation,
    ) -> Result<(), RemoteError> {
        let dir = self.resource_dir(resource)?;
        let marker = Self::body_path(&dir, SubResourceKind::Resource);
        let exists = tokio::fs::try_exists(&marker)
            .await
            .map_err(|e| io_error(&marker, e))?;

        match mutation {
            Mutation::CreateResource => {
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| io_error(&dir, e))?;
            }
            _ if !exists => {
                return Err(RemoteError::NotFound(format!("resource {}", resource)));
            }
            Mutation::DeleteResource { force } => {
                let mut entries = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|e| io_error(&dir, e))?;
                let mut others = 0;
                while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                    if entry.path() != marker {
                        others += 1;
                    }
                }
                if others > 0 && !force {
                    return Err(RemoteError::Permanent(format!(
                        "resource {} still holds {} sub-resource(s), use force",
                        resource, others
                    )));
                }
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| io_error(&dir, e))?;
                debug!(resource, "Deleted resource directory");
                return Ok(());
            }
            _ => {}
        }

        let path = Self::body_path(&dir, kind);
        let current = Self::read(&path).await?;
        let next = wire::project(resource, kind, current.as_ref(), mutation)
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        match next {
            Some(body) => Self::write(&path, &body).await?,
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            },
        }
        debug!(resource, %kind, op = mutation.name(), path = %path.display(), "Wrote state file");
        Ok(())
    }
}
