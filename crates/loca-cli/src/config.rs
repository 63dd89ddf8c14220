//! The `loca` config file and the settings resolved from it.
//!
//! The file lives at `$XDG_CONFIG_HOME/loca/config.toml` (default
//! `~/.config/loca/config.toml`). Every setting resolves as
//! CLI flag > env var > config file > built-in default.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use loca_db::config::{DATABASE_URL_ENV, DbConfig};
use loca_db::models::ProviderKind;

// -----------------------------------------------------------------------
// File layout
// -----------------------------------------------------------------------

/// On-disk shape of `config.toml`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    /// Fallback API keys by provider name, used by `loca agent add` when
    /// no `--api-key` is given.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_keys: BTreeMap<String, String>,
}

/// `[database]` table.
#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// Directory holding `config.toml`.
pub fn config_dir() -> PathBuf {
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg) => PathBuf::from(xdg).join("loca"),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("loca"),
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Read `config.toml`. Fails when the file is missing or malformed.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write `config.toml`, creating its directory. On Unix the file is made
/// readable by its owner only.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let path = dir.join("config.toml");
    let raw = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, raw)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// API keys
// -----------------------------------------------------------------------

/// Conventional environment variable holding the API key for `kind`.
pub fn api_key_env(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Claude => "ANTHROPIC_API_KEY",
        ProviderKind::Openai => "OPENAI_API_KEY",
        ProviderKind::Gemini => "GEMINI_API_KEY",
        ProviderKind::Deepseek => "DEEPSEEK_API_KEY",
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Settings after applying the resolution chain.
#[derive(Debug)]
pub struct LocaConfig {
    pub db_config: DbConfig,
    pub api_keys: BTreeMap<String, String>,
}

impl LocaConfig {
    /// Database URL from `--database-url`, then `LOCA_DATABASE_URL`, then
    /// `[database] url`, then [`DbConfig::default_url`]. A missing config
    /// file is not an error.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = match (cli_db_url, std::env::var(DATABASE_URL_ENV).ok(), &file_config) {
            (Some(url), _, _) => url.to_string(),
            (None, Some(url), _) => url,
            (None, None, Some(cfg)) => cfg.database.url.clone(),
            (None, None, None) => DbConfig::default_url(),
        };

        Ok(Self {
            db_config: DbConfig::new(db_url),
            api_keys: file_config.map(|cfg| cfg.api_keys).unwrap_or_default(),
        })
    }

    /// API key for `kind`: explicit value > provider env var > config file.
    pub fn api_key(&self, kind: ProviderKind, explicit: Option<&str>) -> Option<String> {
        if let Some(key) = explicit {
            return Some(key.to_string());
        }
        if let Ok(key) = std::env::var(api_key_env(kind)) {
            if !key.is_empty() {
                return Some(key);
            }
        }
        self.api_keys.get(&kind.to_string()).cloned()
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `f` with `XDG_CONFIG_HOME` pointing at a fresh temp dir, holding
    /// the env lock, and restore the variable afterwards.
    fn with_config_home<T>(f: impl FnOnce(&std::path::Path) -> T) -> T {
        let _guard = crate::test_util::lock_env();
        let home = tempfile::TempDir::new().unwrap();
        let saved = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", home.path()) };

        let out = f(home.path());

        match saved {
            Some(v) => unsafe { std::env::set_var("XDG_CONFIG_HOME", v) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
        out
    }

    #[test]
    fn written_config_reads_back() {
        let written = ConfigFile {
            database: DatabaseSection {
                url: "sqlite:///tmp/test.db".to_string(),
            },
            api_keys: BTreeMap::from([("claude".to_string(), "sk-ant-test".to_string())]),
        };
        let loaded = with_config_home(|_| {
            save_config(&written).unwrap();
            load_config().unwrap()
        });

        assert_eq!(loaded.database.url, written.database.url);
        assert_eq!(loaded.api_keys, written.api_keys);
    }

    #[cfg(unix)]
    #[test]
    fn written_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let mode = with_config_home(|home| {
            save_config(&ConfigFile {
                database: DatabaseSection {
                    url: "sqlite://loca.db".to_string(),
                },
                api_keys: BTreeMap::new(),
            })
            .unwrap();
            std::fs::metadata(home.join("loca").join("config.toml"))
                .unwrap()
                .permissions()
                .mode()
        });

        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn db_url_precedence() {
        let (from_flag, from_env, from_file, fallback) = with_config_home(|_| {
            unsafe { std::env::remove_var(DATABASE_URL_ENV) };
            let fallback = LocaConfig::resolve(None).unwrap();

            save_config(&ConfigFile {
                database: DatabaseSection {
                    url: "sqlite://file.db".to_string(),
                },
                api_keys: BTreeMap::new(),
            })
            .unwrap();
            let from_file = LocaConfig::resolve(None).unwrap();

            unsafe { std::env::set_var(DATABASE_URL_ENV, "sqlite://env.db") };
            let from_env = LocaConfig::resolve(None).unwrap();
            let from_flag = LocaConfig::resolve(Some("sqlite://cli.db")).unwrap();
            unsafe { std::env::remove_var(DATABASE_URL_ENV) };

            (from_flag, from_env, from_file, fallback)
        });

        assert_eq!(from_flag.db_config.database_url, "sqlite://cli.db");
        assert_eq!(from_env.db_config.database_url, "sqlite://env.db");
        assert_eq!(from_file.db_config.database_url, "sqlite://file.db");
        assert_eq!(fallback.db_config.database_url, DbConfig::default_url());
        assert!(fallback.api_keys.is_empty());
    }

    #[test]
    fn api_key_prefers_explicit_then_env_then_file() {
        let _guard = crate::test_util::lock_env();

        let config = LocaConfig {
            db_config: DbConfig::new(DbConfig::MEMORY_URL),
            api_keys: BTreeMap::from([("deepseek".to_string(), "from-file".to_string())]),
        };

        unsafe { std::env::remove_var("DEEPSEEK_API_KEY") };
        assert_eq!(
            config.api_key(ProviderKind::Deepseek, None).as_deref(),
            Some("from-file")
        );

        unsafe { std::env::set_var("DEEPSEEK_API_KEY", "from-env") };
        assert_eq!(
            config.api_key(ProviderKind::Deepseek, None).as_deref(),
            Some("from-env")
        );
        assert_eq!(
            config.api_key(ProviderKind::Deepseek, Some("explicit")).as_deref(),
            Some("explicit")
        );
        unsafe { std::env::remove_var("DEEPSEEK_API_KEY") };

        unsafe { std::env::remove_var("GEMINI_API_KEY") };
        assert_eq!(config.api_key(ProviderKind::Gemini, None), None);
    }

    #[test]
    fn config_file_lives_under_loca_dir() {
        assert!(config_path().ends_with("loca/config.toml"));
    }
}
