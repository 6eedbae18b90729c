//! Persistent log identity.
//!
//! Each node keeps a small JSON policy file naming its log collection and a
//! private/public id pair. The file is created on first start and validated
//! on every start after that.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Collection every node log belongs to.
pub const COLLECTION: &str = "embednet.log";

pub const POLICY_FILE: &str = "node.log.conf";

#[derive(Debug, Error)]
pub enum LogPolicyError {
    #[error("log policy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log policy {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("log policy {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPolicy {
    pub collection: String,
    pub private_id: Uuid,
    pub public_id: Uuid,
}

impl LogPolicy {
    pub fn generate() -> Self {
        Self {
            collection: COLLECTION.to_string(),
            private_id: Uuid::new_v4(),
            public_id: Uuid::new_v4(),
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(POLICY_FILE)
    }

    /// Load `<dir>/node.log.conf`, creating it if it does not exist yet.
    pub fn load_or_create(dir: &Path) -> Result<Self, LogPolicyError> {
        let path = Self::path_in(dir);
        let policy = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| LogPolicyError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let policy = Self::generate();
                policy.save(&path)?;
                tracing::debug!(path = %path.display(), "Created log policy");
                policy
            }
            Err(source) => return Err(LogPolicyError::Io { path, source }),
        };
        policy.validate(&path)?;
        Ok(policy)
    }

    fn save(&self, path: &Path) -> Result<(), LogPolicyError> {
        let io_err = |source| LogPolicyError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(self).map_err(|source| LogPolicyError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }

    fn validate(&self, path: &Path) -> Result<(), LogPolicyError> {
        let invalid = |reason: &str| LogPolicyError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if self.collection != COLLECTION {
            return Err(invalid(&format!(
                "collection {:?}, want {COLLECTION:?}",
                self.collection
            )));
        }
        if self.private_id.is_nil() || self.public_id.is_nil() {
            return Err(invalid("nil log id"));
        }
        if self.private_id == self.public_id {
            return Err(invalid("private and public ids must differ"));
        }
        Ok(())
    }

    /// The id log lines are tagged with.
    pub fn log_id(&self) -> String {
        self.public_id.simple().to_string()
    }
}
