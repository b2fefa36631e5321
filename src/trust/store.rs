// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TrustRecord;
use crate::identity::PeerKey;

/// One persisted trust record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub peer: PeerKey,
    #[serde(flatten)]
    pub record: TrustRecord,
}

#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("trust store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("trust store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Key-value hook used to carry trust records across restarts.
pub trait TrustStore: Send + Sync {
    fn load(&self) -> Result<Vec<TrustEntry>, TrustStoreError>;
    fn save(&self, entries: &[TrustEntry]) -> Result<(), TrustStoreError>;
}

/// [`TrustStore`] persisting records as a JSON array in a single file.
#[derive(Clone, Debug)]
pub struct JsonTrustStore {
    path: PathBuf,
}

impl JsonTrustStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> TrustStoreError {
        TrustStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl TrustStore for JsonTrustStore {
    fn load(&self) -> Result<Vec<TrustEntry>, TrustStoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| TrustStoreError::Corrupt {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(self.io_error(error)),
        }
    }

    fn save(&self, entries: &[TrustEntry]) -> Result<(), TrustStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|error| self.io_error(error))?;
            }
        }
        let data = serde_json::to_vec_pretty(entries)
            .map_err(|error| self.io_error(io::Error::other(error)))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data).map_err(|error| self.io_error(error))?;
        fs::rename(&tmp, &self.path).map_err(|error| self.io_error(error))?;
        Ok(())
    }
}
