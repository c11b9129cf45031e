use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::pool::{Connector, RemoteConnection};
use crate::remote::{path_segments, TransferError};

/// Reads item files from a local directory laid out like the remote tree.
/// Used for staging environments that sync a mirror of the remote source.
#[derive(Debug, Clone)]
pub struct MirrorConnector {
    root: PathBuf,
}

impl MirrorConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Connector for MirrorConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| TransferError::Connect(format!("{}: {e}", self.root.display())))?;
        if !meta.is_dir() {
            return Err(TransferError::Connect(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(Box::new(MirrorConnection {
            root: self.root.clone(),
        }))
    }

    fn kind(&self) -> &'static str {
        "mirror"
    }
}

struct MirrorConnection {
    root: PathBuf,
}

fn confined(root: &Path, path: &str) -> Result<PathBuf, TransferError> {
    Ok(path_segments(path)?
        .into_iter()
        .fold(root.to_path_buf(), |full, seg| full.join(seg)))
}

#[async_trait]
impl RemoteConnection for MirrorConnection {
    async fn retrieve(&mut self, path: &str) -> Result<Option<Vec<u8>>, TransferError> {
        let full = confined(&self.root, path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::Io(format!("{}: {e}", full.display()))),
        }
    }

    fn is_alive(&self) -> bool {
        self.root.is_dir()
    }
}
