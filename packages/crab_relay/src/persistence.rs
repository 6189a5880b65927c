//! Optional on-disk store for received files.

use std::path::{Path, PathBuf};

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("refusing to store file with unusable name {0:?}")]
    InvalidName(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes completed transfers into one directory, keyed by file name.
///
/// A later file with the same name replaces the earlier one.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `body` under the final path component of `file_name`.
    pub async fn store(&self, file_name: &str, body: &[u8]) -> Result<PathBuf, PersistError> {
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| PersistError::InvalidName(file_name.to_string()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| PersistError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.dir.join(name);
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| PersistError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), bytes = body.len(), "stored file");
        Ok(path)
    }
}

/// Strip any directory part a client put in the name. `None` if nothing usable remains.
fn sanitize_file_name(raw: &str) -> Option<&str> {
    let name = raw.rsplit(|c| c == '/' || c == '\\').next()?.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return None;
    }
    Some(name)
}
