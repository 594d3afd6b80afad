use anyhow::{Context, Result};
use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_NAMESPACE: &str = "homelink";

/// File-backed deployment settings, read once at startup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub data: Data,
    pub bridge: Bridge,
}

impl Config {
    pub fn read<D>(config_file: D) -> Result<Self, ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        config::Config::builder()
            .add_source(config::File::from(config_file))
            .build()?
            .try_deserialize()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Data {
    pub dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Bridge {
    /// Topic namespace shared by every app talking to this bridge.
    pub namespace: String,
    /// Apps the bridge accepts registrations from.
    #[serde(default)]
    pub apps: Vec<App>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct App {
    pub unique_id: String,
    pub name: String,
}

#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("config not initialized")]
pub struct ConfigNotInitialized {}

pub fn read_config(config_path: PathBuf) -> Result<Result<Config, ConfigNotInitialized>> {
    if config_path.exists() {
        info!(
            "Using config file at default path: {}",
            config_path.display()
        );
    } else {
        return Ok(Err(ConfigNotInitialized {}));
    }

    let file = Config::read(&config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

    Ok(Ok(file))
}

pub fn initial_setup<F>(config_path: PathBuf, config_file: F) -> Result<()>
where
    F: Fn() -> Result<Config>,
{
    info!("Config file not found, running initial setup...");
    ensure_directory_exists(config_path.as_path())?;
    let initial_config = config_file()?;

    let toml = toml::to_string(&initial_config)?;
    fs::write(&config_path, toml)?;

    info!(
        "Initial setup complete, config file created at {}",
        config_path.as_path().display()
    );
    Ok(())
}

pub fn default_config(data_dir: PathBuf) -> Result<Config> {
    Ok(Config {
        data: Data { dir: data_dir },
        bridge: Bridge {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            apps: vec![],
        },
    })
}

pub fn ensure_directory_exists(file: &Path) -> Result<(), std::io::Error> {
    if let Some(path) = file.parent() {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
    }
    Ok(())
}
