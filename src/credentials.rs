//! Worker identity and its on-disk credential file.
//!
//! The file is a small JSON document `{"id", "alias", "secret"}` where the
//! secret is base64-encoded. Its absence is the only trigger for registering a
//! new worker.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::CredentialsError;

/// Identity assigned to this worker by the coordinator.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub id: i64,
    pub alias: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerIdentity")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    id: i64,
    alias: String,
    secret: String,
}

impl WorkerIdentity {
    pub fn new(id: i64, alias: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            alias: alias.into(),
            secret: secret.into(),
        }
    }

    /// Build an identity from the base64 secret handed out at registration.
    pub fn from_base64(
        id: i64,
        alias: impl Into<String>,
        secret_b64: &str,
    ) -> Result<Self, base64::DecodeError> {
        let secret = general_purpose::STANDARD.decode(secret_b64.trim())?;
        Ok(Self::new(id, alias, secret))
    }

    /// HMAC key for request signing.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Load the identity stored at `path`. Returns `Ok(None)` if no file exists.
    pub fn load(path: &Path) -> Result<Option<Self>, CredentialsError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let stored: StoredIdentity =
            serde_json::from_str(&raw).map_err(|e| invalid(path, e.to_string()))?;
        let identity = Self::from_base64(stored.id, stored.alias, &stored.secret)
            .map_err(|e| invalid(path, format!("secret is not valid base64: {e}")))?;
        Ok(Some(identity))
    }

    /// Persist the identity to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), CredentialsError> {
        let stored = StoredIdentity {
            id: self.id,
            alias: self.alias.clone(),
            secret: general_purpose::STANDARD.encode(&self.secret),
        };
        let raw = serde_json::to_string(&stored).map_err(|e| invalid(path, e.to_string()))?;

        let io_err = |source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, raw).map_err(io_err)
    }
}

fn invalid(path: &Path, reason: String) -> CredentialsError {
    CredentialsError::Invalid {
        path: PathBuf::from(path),
        reason,
    }
}
