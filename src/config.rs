use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_PATHS: [&str; 3] = ["photobackup.toml", "config.toml", "data/photobackup.toml"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `host:port`, or `:port` for every interface.
    #[serde(default = "default_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Holds `photobackup.db` and the `files/` blob tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_addr() -> String {
    ":8080".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Defaults, then the first config file found, then `DATA_DIR` / `ADDR`.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> anyhow::Result<Self> {
        for path in CONFIG_PATHS {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!(path, "loaded configuration file");
                return Ok(config);
            }
        }

        tracing::info!("no configuration file found, using defaults");
        Ok(Config::default())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_env("DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Some(val) = non_empty_env("ADDR") {
            self.server.addr = val;
        }
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.storage.data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.storage.data_dir).join("photobackup.db")
    }

    pub fn files_dir(&self) -> PathBuf {
        Path::new(&self.storage.data_dir).join("files")
    }

    /// Address handed to the listener. A bare `:port` binds all interfaces.
    pub fn bind_addr(&self) -> String {
        match self.server.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.server.addr.clone(),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
