//! On-disk session persistence.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use super::{CookieJar, SessionRecord};
use crate::error::Result;

/// Reads and writes one site's persisted session file, plus the optional
/// manual cookie file a user exports from their browser.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    manual_path: Option<PathBuf>,
}

impl SessionStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            manual_path: None,
        }
    }

    /// Also consult `path` for manually exported cookies.
    pub fn with_manual_cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.manual_path = Some(path.into());
        self
    }

    /// Persisted session file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Manual cookie file, if configured.
    pub fn manual_path(&self) -> Option<&Path> {
        self.manual_path.as_deref()
    }

    /// Load the persisted record. Absent, empty or malformed files yield
    /// `None`.
    pub fn load(&self) -> Option<SessionRecord> {
        let content = read_optional(&self.path)?;
        match serde_json::from_str::<SessionRecord>(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring malformed session file");
                None
            }
        }
    }

    /// Load the manual cookie file.
    ///
    /// Accepts a flat `{name: value}` object, an object with a nested
    /// `cookies` map, or a browser export array of `{name, value}` objects.
    pub fn load_manual(&self) -> Option<CookieJar> {
        let path = self.manual_path.as_ref()?;
        let content = read_optional(path)?;
        let value: Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed cookie file");
                return None;
            }
        };
        let jar = manual_cookies(&value);
        if jar.is_empty() {
            tracing::warn!(path = %path.display(), "cookie file contains no cookies");
            return None;
        }
        Some(jar)
    }

    /// Write `record` atomically with owner-only permissions.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session.json".into());
        let tmp = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        let json = serde_json::to_string_pretty(record)?;
        let written = write_private(&tmp, json.as_bytes()).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!(path = %self.path.display(), cookies = record.cookies.len(), "session saved");
        Ok(())
    }

    /// Remove the persisted file. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "session file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => None,
        Ok(content) => Some(content),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read session data");
            None
        }
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn manual_cookies(value: &Value) -> CookieJar {
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(nested)) = map.get("cookies") {
                return nested
                    .iter()
                    .filter_map(|(k, v)| scalar(v).map(|v| (k.clone(), v)))
                    .collect();
            }
            map.iter()
                .filter_map(|(k, v)| scalar(v).map(|v| (k.clone(), v)))
                .collect()
        }
        Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name")?.as_str()?;
                let value = scalar(entry.get("value")?)?;
                Some((name.to_string(), value))
            })
            .collect(),
        _ => CookieJar::new(),
    }
}
