//! Crash marker file whose presence at startup means the last run did not
//! shut down cleanly.

use std::path::{Path, PathBuf};

use crate::utils::ViewstampError;
use crate::server::ReplicaId;

/// Marker file at `<dir>/crash-<id>`.
#[derive(Debug, Clone)]
pub struct CrashMarker {
    me: ReplicaId,
    path: PathBuf,
}

impl CrashMarker {
    pub fn new(me: ReplicaId, dir: impl AsRef<Path>) -> Self {
        CrashMarker {
            me,
            path: dir.as_ref().join(format!("crash-{}", me)),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the marker. Returns true if it already existed, meaning this
    /// replica must start in recovery.
    pub async fn plant(&self) -> Result<bool, ViewstampError> {
        let existed = tokio::fs::try_exists(&self.path).await?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, format!("{}\n", self.me)).await?;
        if existed {
            pf_warn!(self.me; "found crash marker '{}'", self.path.display());
        }
        Ok(existed)
    }

    /// Deletes the marker on clean shutdown. Missing marker is not an error.
    pub async fn remove(&self) -> Result<(), ViewstampError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
