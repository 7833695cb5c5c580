//! Configuration for knowledgestore

use eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite index file
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Maximum chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// FTS recall candidate count
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,

    /// Number of re-ranked chunks kept
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("knowledgestore")
        .join("knowledge.db")
}

fn default_chunk_size() -> usize {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_recall_limit() -> usize {
    crate::DEFAULT_RECALL_LIMIT
}

fn default_top_k() -> usize {
    crate::DEFAULT_TOP_K
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            chunk_size: default_chunk_size(),
            recall_limit: default_recall_limit(),
            top_k: default_top_k(),
        }
    }
}

impl Config {
    /// Load config from file, or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = serde_yaml::from_str(&content)?;
            return Ok(config);
        }

        // Try default locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("knowledgestore").join("config.yml")),
            Some(PathBuf::from("knowledgestore.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        Ok(Config::default())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.recall_limit, crate::DEFAULT_RECALL_LIMIT);
        assert_eq!(config.top_k, crate::DEFAULT_TOP_K);
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.yml");
        std::fs::write(&path, "chunk_size: 256\ntop_k: 3\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.top_k, 3);
        assert_eq!(config.recall_limit, crate::DEFAULT_RECALL_LIMIT);
    }
}
