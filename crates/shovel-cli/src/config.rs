//! Configuration file management for shovel.
//!
//! Provides a TOML-based config file at `~/.config/shovel/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shovel_core::agent::claude_code::DEFAULT_MODEL;

pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_MAX_TURNS: u32 = 100;
pub const DEFAULT_REPO_DIR: &str = "./repo";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_CLAUDE_BIN: &str = "claude";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub run: RunSection,
}

/// `[run]` table. Every key is optional.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_bin: Option<String>,
}

impl ConfigFile {
    /// The file `shovel init` writes: every key set to its default.
    pub fn with_defaults() -> Self {
        Self {
            run: RunSection {
                model: Some(DEFAULT_MODEL.to_string()),
                max_workers: Some(DEFAULT_MAX_WORKERS),
                max_turns: Some(DEFAULT_MAX_TURNS),
                repo_dir: Some(PathBuf::from(DEFAULT_REPO_DIR)),
                log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
                claude_bin: Some(DEFAULT_CLAUDE_BIN.to_string()),
            },
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the shovel config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/shovel` or `~/.config/shovel`,
/// including on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("shovel");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("shovel")
}

/// Return the path to the shovel config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file if there is one. A file that exists but does not
/// parse is an error.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line, if any.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub model: Option<String>,
    pub max_workers: Option<usize>,
    pub max_turns: Option<u32>,
    pub repo_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub claude_bin: Option<String>,
}

/// Fully resolved run settings, ready for use.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub model: String,
    pub max_workers: usize,
    pub max_turns: u32,
    pub repo_dir: PathBuf,
    pub log_dir: PathBuf,
    pub claude_bin: String,
}

impl RunSettings {
    /// Resolve against the process environment and the config file on disk.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_config()?;
        Self::resolve_from(cli, file.as_ref(), |key| std::env::var(key).ok())
    }

    /// Resolve using the chain: CLI flag > `SHOVEL_*` env var > config file > default.
    pub fn resolve_from(
        cli: &CliOverrides,
        file: Option<&ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let run = file.map(|f| &f.run);

        let model = cli
            .model
            .clone()
            .or_else(|| env("SHOVEL_MODEL"))
            .or_else(|| run.and_then(|r| r.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let max_workers = match cli.max_workers {
            Some(n) => n,
            None => match env("SHOVEL_MAX_WORKERS") {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("SHOVEL_MAX_WORKERS is not a number: {raw:?}"))?,
                None => run
                    .and_then(|r| r.max_workers)
                    .unwrap_or(DEFAULT_MAX_WORKERS),
            },
        };
        if max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }

        let max_turns = match cli.max_turns {
            Some(n) => n,
            None => match env("SHOVEL_MAX_TURNS") {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("SHOVEL_MAX_TURNS is not a number: {raw:?}"))?,
                None => run.and_then(|r| r.max_turns).unwrap_or(DEFAULT_MAX_TURNS),
            },
        };
        if max_turns == 0 {
            anyhow::bail!("max_turns must be at least 1");
        }

        let repo_dir = cli
            .repo_dir
            .clone()
            .or_else(|| env("SHOVEL_REPO_DIR").map(PathBuf::from))
            .or_else(|| run.and_then(|r| r.repo_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPO_DIR));

        let log_dir = cli
            .log_dir
            .clone()
            .or_else(|| env("SHOVEL_LOG_DIR").map(PathBuf::from))
            .or_else(|| run.and_then(|r| r.log_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let claude_bin = cli
            .claude_bin
            .clone()
            .or_else(|| env("SHOVEL_CLAUDE_BIN"))
            .or_else(|| run.and_then(|r| r.claude_bin.clone()))
            .unwrap_or_else(|| DEFAULT_CLAUDE_BIN.to_string());

        Ok(Self {
            model,
            max_workers,
            max_turns,
            repo_dir,
            log_dir,
            claude_bin,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
