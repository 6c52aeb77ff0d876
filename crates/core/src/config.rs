use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::assembler::{AssemblyConfig, BudgetUnit};
use crate::error::{DoclinkError, Result};
use crate::similarity::DEFAULT_SHARD_SIZE;

pub const DEFAULT_CONFIG: &str = "doclink.toml";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DoclinkConfig {
    pub database: PathBuf,
    /// age identity file holding the master key that wraps per-file keys.
    pub identity_path: Option<PathBuf>,
    pub embedding_dimensions: usize,
    pub shard_size: usize,
    pub merge_adjacent: bool,
    pub max_context: Option<usize>,
    pub budget_unit: BudgetUnit,
    pub bind_addr: String,
}

impl Default for DoclinkConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("doclink.sqlite"),
            identity_path: None,
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            shard_size: DEFAULT_SHARD_SIZE,
            merge_adjacent: true,
            max_context: None,
            budget_unit: BudgetUnit::Chars,
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl DoclinkConfig {
    /// Reads `DOCLINK_CONFIG` (default `doclink.toml`), then applies the
    /// environment overrides. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = env::var("DOCLINK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|e| DoclinkError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| DoclinkError::Config(e.to_string()))
    }

    pub fn apply_env(&mut self) {
        if let Ok(db) = env::var("DOCLINK_DB") {
            self.database = PathBuf::from(db);
        }
        if let Ok(identity) = env::var("DOCLINK_IDENTITY") {
            self.identity_path = Some(PathBuf::from(identity));
        }
        if let Some(dims) = env::var("DOCLINK_EMBED_DIMS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.embedding_dimensions = dims;
        }
        if let Ok(addr) = env::var("DOCLINK_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            return Err(DoclinkError::Config(
                "embedding_dimensions must be positive".to_string(),
            ));
        }
        if self.max_context == Some(0) {
            return Err(DoclinkError::Config(
                "max_context must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn assembly(&self) -> AssemblyConfig {
        AssemblyConfig {
            merge_adjacent: self.merge_adjacent,
            max_context: self.max_context,
            budget_unit: self.budget_unit,
        }
    }
}
