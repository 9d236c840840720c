/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PLACEHOLDER: &str = "static/notfound.png";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Public base URL, e.g. `https://board.example`. Object and actor ids live below it.
    pub domain: String,
    pub data_dir: Option<String>,
    pub db_path: Option<String>,
    pub key_dir: Option<String>,
    /// Root that attachment hrefs (`<domain>/<relative path>`) resolve against.
    pub files_root: Option<String>,
    /// Relative path of the "not found" image substituted into tombstoned media.
    pub placeholder_path: Option<String>,
    /// Salt for secure (`##`) tripcodes. Secure trips are refused when unset.
    pub tripcode_salt: Option<String>,
    pub key_bits: Option<usize>,
    pub http_timeout_secs: Option<u64>,
    pub max_date_skew_secs: Option<u64>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            domain: "http://localhost:3000".to_string(),
            data_dir: None,
            db_path: None,
            key_dir: None,
            files_root: None,
            placeholder_path: Some(DEFAULT_PLACEHOLDER.to_string()),
            tripcode_salt: None,
            key_bits: Some(2048),
            http_timeout_secs: Some(15),
            max_date_skew_secs: Some(12 * 3600),
        }
    }
}

impl BoardConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: BoardConfig = serde_json::from_str(text).context("parse config json")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let domain = self.domain.trim();
        if !(domain.starts_with("http://") || domain.starts_with("https://")) {
            return Err(anyhow!("domain must be an http(s) url, got {domain:?}"));
        }
        if let Some(bits) = self.key_bits {
            if bits < 1024 {
                return Err(anyhow!("key_bits too small: {bits}"));
            }
        }
        Ok(())
    }

    pub fn domain(&self) -> &str {
        self.domain.trim().trim_end_matches('/')
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => default_data_dir(),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        self.resolve(self.db_path.as_deref(), "chanfed.sqlite")
    }

    pub fn key_dir(&self) -> Result<PathBuf> {
        self.resolve(self.key_dir.as_deref(), "pem/board")
    }

    pub fn files_root(&self) -> Result<PathBuf> {
        match self.files_root.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => self.data_dir(),
        }
    }

    pub fn placeholder_path(&self) -> &str {
        self.placeholder_path
            .as_deref()
            .map(|p| p.trim().trim_start_matches('/'))
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PLACEHOLDER)
    }

    pub fn placeholder_href(&self) -> String {
        format!("{}/{}", self.domain(), self.placeholder_path())
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits.unwrap_or(2048)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs.unwrap_or(15).max(1))
    }

    pub fn max_date_skew(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_date_skew_secs.unwrap_or(12 * 3600))
    }

    fn resolve(&self, v: Option<&str>, default_rel: &str) -> Result<PathBuf> {
        match v.map(str::trim).filter(|s| !s.is_empty()) {
            Some(p) if Path::new(p).is_absolute() => Ok(PathBuf::from(p)),
            Some(p) => Ok(self.data_dir()?.join(p)),
            None => Ok(self.data_dir()?.join(default_rel)),
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("CHANFED_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "chanfed", "Chanfed")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_data_dir() {
        let cfg = BoardConfig::from_json(
            r#"{"domain":"https://board.example/","data_dir":"/srv/chan","key_dir":"keys","db_path":"/var/db/chan.sqlite"}"#,
        )
        .unwrap();
        assert_eq!(cfg.domain(), "https://board.example");
        assert_eq!(cfg.key_dir().unwrap(), PathBuf::from("/srv/chan/keys"));
        assert_eq!(cfg.db_path().unwrap(), PathBuf::from("/var/db/chan.sqlite"));
        assert_eq!(cfg.files_root().unwrap(), PathBuf::from("/srv/chan"));
        assert_eq!(cfg.placeholder_href(), "https://board.example/static/notfound.png");
    }

    #[test]
    fn rejects_non_http_domain() {
        assert!(BoardConfig::from_json(r#"{"domain":"board.example"}"#).is_err());
    }
}
