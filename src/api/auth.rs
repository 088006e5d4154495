// Session tokens - bearer credentials persisted between runs

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Access and refresh tokens as issued by the `/token/` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// The logged-in state carried across commands and across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub username: Option<String>,
    pub tokens: Option<TokenPair>,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn clear(&mut self) {
        self.username = None;
        self.tokens = None;
    }
}

/// Stores the session as a JSON file, readable by the owner only.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored session; a missing file is an empty session.
    pub fn load(&self) -> AppResult<Session> {
        if !self.path.exists() {
            return Ok(Session::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            AppError::SessionError(format!("Failed to read session file: {}", e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::SessionError(format!("Failed to parse session file: {}", e))
        })
    }

    pub fn save(&self, session: &Session) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    AppError::SessionError(format!("Failed to create session directory: {}", e))
                })?;
            }
        }
        let raw = serde_json::to_string_pretty(session).map_err(|e| {
            AppError::SerializationError(format!("Failed to serialize session: {}", e))
        })?;
        fs::write(&self.path, raw).map_err(|e| {
            AppError::SessionError(format!("Failed to write session file: {}", e))
        })?;
        restrict_to_owner(&self.path)?;
        Ok(())
    }

    /// Removes the stored session; missing files are fine.
    pub fn clear(&self) -> AppResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::SessionError(format!(
                "Failed to remove session file: {}",
                e
            ))),
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> AppResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        AppError::SessionError(format!("Failed to restrict session file: {}", e))
    })
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> AppResult<()> {
    Ok(())
}

/// Reads the `exp` claim out of a JWT without verifying it. The server
/// verifies; the client only wants to know when to refresh.
pub fn token_expiry(access: &str) -> Option<DateTime<Utc>> {
    let payload = access.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// True when the token expires within `leeway_secs` from now. Tokens
/// whose expiry cannot be read are treated as live; the server will
/// reject them if they are not.
pub fn token_expires_soon(access: &str, leeway_secs: i64) -> bool {
    match token_expiry(access) {
        Some(exp) => exp - chrono::Duration::seconds(leeway_secs) <= Utc::now(),
        None => false,
    }
}
