/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::BoardConfig;
use crate::db::Db;
use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque blacklist check applied to inbound content before it is mirrored.
pub trait ContentFilter: Send + Sync {
    fn is_blocked(&self, content: &str) -> bool;
}

impl<F> ContentFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_blocked(&self, content: &str) -> bool {
        self(content)
    }
}

pub struct AllowAll;

impl ContentFilter for AllowAll {
    fn is_blocked(&self, _content: &str) -> bool {
        false
    }
}

/// Shared handles every component takes explicitly.
#[derive(Clone)]
pub struct Context {
    pub cfg: Arc<BoardConfig>,
    pub db: Db,
    files_root: PathBuf,
    filter: Arc<dyn ContentFilter>,
}

impl Context {
    pub fn open(cfg: BoardConfig) -> Result<Self> {
        cfg.validate()?;
        let db_path = cfg.db_path()?;
        let db = Db::open(&db_path).with_context(|| format!("open board db {}", db_path.display()))?;
        let files_root = cfg.files_root()?;
        Ok(Self {
            cfg: Arc::new(cfg),
            db,
            files_root,
            filter: Arc::new(AllowAll),
        })
    }

    pub fn with_filter(mut self, filter: impl ContentFilter + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn is_blocked(&self, content: &str) -> bool {
        self.filter.is_blocked(content)
    }

    pub fn domain(&self) -> &str {
        self.cfg.domain()
    }

    pub fn files_root(&self) -> &Path {
        &self.files_root
    }
}

#[cfg(test)]
pub(crate) fn test_context(dir: &Path) -> Context {
    let cfg = BoardConfig {
        domain: "https://b.example".to_string(),
        data_dir: Some(dir.to_string_lossy().into_owned()),
        tripcode_salt: Some("pepper".to_string()),
        key_bits: Some(1024),
        ..Default::default()
    };
    Context::open(cfg).unwrap()
}
