use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compiler::DEFAULT_EXTENSION;
use crate::error::{Error, Result};
use crate::pool::DEFAULT_CAPACITY;

pub const CONFIG_FILE: &str = "wx.config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

fn default_views_dir() -> PathBuf {
    PathBuf::from("views")
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_out() -> PathBuf {
    PathBuf::from("app.wx.rs")
}

fn default_pool_size() -> usize {
    DEFAULT_CAPACITY
}

fn default_bundler() -> CommandConfig {
    CommandConfig::new("esbuild")
}

fn default_vm() -> CommandConfig {
    CommandConfig::new("node")
}

/// App level settings read from `wx.config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WxConfig {
    #[serde(default = "default_views_dir")]
    pub views_dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_out")]
    pub out: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_bundler")]
    pub bundler: CommandConfig,
    #[serde(default = "default_vm")]
    pub vm: CommandConfig,
}

impl Default for WxConfig {
    fn default() -> Self {
        Self {
            views_dir: default_views_dir(),
            extension: default_extension(),
            out: default_out(),
            pool_size: default_pool_size(),
            bundler: default_bundler(),
            vm: default_vm(),
        }
    }
}

impl WxConfig {
    /// Reads `wx.config.json` from `root`; a missing file means defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Self::parse(&content).map_err(|message| Error::Config { path, message })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut config: Self = serde_json::from_str(content).map_err(|e| e.to_string())?;
        if config.pool_size == 0 {
            config.pool_size = DEFAULT_CAPACITY;
        }
        if config.extension.trim().is_empty() {
            config.extension = default_extension();
        }
        config.extension = config.extension.trim_start_matches('.').to_string();
        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool_capacity: self.pool_size,
        }
    }
}

/// Render engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Workers (script VMs) per registered view.
    pub pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_CAPACITY,
        }
    }
}
