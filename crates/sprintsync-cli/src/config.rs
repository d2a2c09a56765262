//! Configuration file management for sprintsync.
//!
//! A TOML file holds the [`SyncConfig`] fields at top level plus an optional
//! `[board]` section. Resolution chain: CLI flag > env var > config file >
//! default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use sprintsync_core::config::{SprintRange, SyncConfig};

pub const CONFIG_ENV: &str = "SPRINTSYNC_CONFIG";
pub const REPOSITORY_ENV: &str = "SPRINTSYNC_REPOSITORY";
pub const LOCAL_CONFIG: &str = "sprintsync.toml";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub board: Option<BoardSection>,
}

/// GitHub project board used when `add_to_board` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSection {
    pub project_number: u64,
    pub project_id: String,
    pub status_field_id: String,
    pub todo_option_id: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the sprintsync config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/sprintsync` or
/// `~/.config/sprintsync`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sprintsync");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sprintsync")
}

/// Return the path to the user-level config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Starter config written by `sprintsync init`.
pub fn starter_config() -> ConfigFile {
    ConfigFile {
        sync: SyncConfig {
            organization: "your-org".to_string(),
            repository: "your-repo".to_string(),
            ..SyncConfig::default()
        },
        board: None,
    }
}

/// Split `owner/name` into its two parts.
pub fn parse_repo(value: &str) -> Result<(String, String)> {
    match value.trim().split_once('/') {
        Some((owner, name))
            if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => bail!("invalid repository {value:?} (expected owner/name)"),
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values from the command line that take precedence over everything.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub repo: Option<String>,
    pub concurrency: Option<usize>,
    pub partitions: Option<usize>,
    pub sprints: Option<SprintRange>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub sync: SyncConfig,
    pub board: Option<BoardSection>,
    /// File the settings came from, if any.
    pub source: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Resolve configuration.
    ///
    /// - File: `--config` > `SPRINTSYNC_CONFIG` > `./sprintsync.toml` >
    ///   `config_path()` > built-in defaults. An explicitly named file must
    ///   exist.
    /// - Repository: `--repo` > `SPRINTSYNC_REPOSITORY` > file.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let explicit = overrides
            .config
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let source = match explicit {
            Some(path) => Some(path),
            None => [PathBuf::from(LOCAL_CONFIG), config_path()]
                .into_iter()
                .find(|p| p.is_file()),
        };

        let file = match &source {
            Some(path) => load_config(path)?,
            None => ConfigFile::default(),
        };
        let ConfigFile { mut sync, board } = file;

        let repo = overrides
            .repo
            .clone()
            .or_else(|| std::env::var(REPOSITORY_ENV).ok());
        if let Some(repo) = repo {
            let (owner, name) = parse_repo(&repo)?;
            sync.organization = owner;
            sync.repository = name;
        }
        if let Some(n) = overrides.concurrency {
            sync.concurrency = n;
        }
        if let Some(n) = overrides.partitions {
            sync.partitions = n;
        }
        if let Some(range) = overrides.sprints {
            sync.sprint_range = Some(range);
        }

        sync.validate().context("invalid configuration")?;
        tracing::debug!(
            source = ?source,
            organization = %sync.organization,
            repository = %sync.repository,
            "configuration resolved"
        );

        Ok(Self { sync, board, source })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
