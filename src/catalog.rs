//! Persisted index configurations shared by the cluster.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use parking_lot::RwLock;

use crate::config::IndexConfig;
use crate::error::Result;

const CONFIG_SUFFIX: &str = "_config.json";

pub trait IndexCatalog: Send + Sync + std::fmt::Debug {
    /// Stores or replaces the config of `config.index_name`.
    fn save(&self, config: &IndexConfig) -> Result<()>;

    fn load(&self, index_name: &str) -> Result<Option<IndexConfig>>;

    fn index_names(&self) -> Result<Vec<String>>;

    fn delete(&self, index_name: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    configs: RwLock<BTreeMap<String, IndexConfig>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexCatalog for MemoryCatalog {
    fn save(&self, config: &IndexConfig) -> Result<()> {
        self.configs
            .write()
            .insert(config.index_name.clone(), config.clone());
        Ok(())
    }

    fn load(&self, index_name: &str) -> Result<Option<IndexConfig>> {
        Ok(self.configs.read().get(index_name).cloned())
    }

    fn index_names(&self) -> Result<Vec<String>> {
        Ok(self.configs.read().keys().cloned().collect())
    }

    fn delete(&self, index_name: &str) -> Result<()> {
        self.configs.write().remove(index_name);
        Ok(())
    }
}

/// One `<index>_config.json` per index in a directory.
#[derive(Debug)]
pub struct FileCatalog {
    dir: PathBuf,
}

impl FileCatalog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Opened index catalog at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, index_name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", index_name, CONFIG_SUFFIX))
    }
}

impl IndexCatalog for FileCatalog {
    fn save(&self, config: &IndexConfig) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(config)?)?;
        tmp.persist(self.path(&config.index_name))
            .map_err(|e| e.error)?;
        debug!("Saved config of index <{}>", config.index_name);
        Ok(())
    }

    fn load(&self, index_name: &str) -> Result<Option<IndexConfig>> {
        let path = self.path(index_name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn index_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let file_name = entry?.file_name();
            if let Some(name) = file_name
                .to_str()
                .and_then(|f| f.strip_suffix(CONFIG_SUFFIX))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, index_name: &str) -> Result<()> {
        let path = self.path(index_name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
