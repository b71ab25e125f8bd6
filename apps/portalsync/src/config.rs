//! CLI configuration.
//!
//! Reads TOML from `--config` or `~/.config/portalsync/portalsync.toml`.
//! Every key is optional. Credentials may come from the file or from
//! `PORTALSYNC_USER` / `PORTALSYNC_TOKEN`; they are never written back.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use portalsync_net::NetConfig;
use portalsync_portal::Account;

pub const USER_VAR: &str = "PORTALSYNC_USER";
pub const TOKEN_VAR: &str = "PORTALSYNC_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Where the local object graph is persisted.
    #[serde(default = "default_graph_path")]
    pub graph_path: PathBuf,

    /// Where downloaded consent videos are stored.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    #[serde(default)]
    pub net: NetConfig,

    #[serde(default)]
    account: Option<AccountFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AccountFile {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

fn default_graph_path() -> PathBuf {
    data_base_dir().join("portalsync").join("graph.json")
}

fn default_media_dir() -> PathBuf {
    data_base_dir().join("portalsync").join("media")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            graph_path: default_graph_path(),
            media_dir: default_media_dir(),
            net: NetConfig::default(),
            account: None,
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the default location when `None`. A missing default
    /// file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_file_path(), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: AppConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.net.base_url = config.net.base_url.trim_end_matches('/').to_string();
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Resolves credentials; environment variables take precedence.
    pub fn account(&self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Account> {
        let file = self.account.clone().unwrap_or_default();
        let username = env(USER_VAR)
            .or(file.username)
            .filter(|u| !u.is_empty())
            .with_context(|| format!("no portal user: set {USER_VAR} or [account].username"))?;
        let token = env(TOKEN_VAR)
            .or(file.token)
            .filter(|t| !t.is_empty())
            .with_context(|| format!("no portal token: set {TOKEN_VAR} or [account].token"))?;
        Ok(Account::new(username, token))
    }
}

fn config_file_path() -> PathBuf {
    config_base_dir().join("portalsync").join("portalsync.toml")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home_dir().join(".config"),
        }
    }
}

fn data_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("LOCALAPPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        match std::env::var("XDG_DATA_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home_dir().join(".local").join("share"),
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portalsync.toml");
        std::fs::write(
            &path,
            r#"
            graph_path = "/var/lib/portalsync/graph.json"
            media_dir = "/var/lib/portalsync/media"

            [net]
            base_url = "https://portal.example/api/"
            max_connections = 8
            chunk_size = 25

            [net.retry]
            max_tries = 5

            [account]
            username = "nurse"
            token = "from-file"
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.graph_path, PathBuf::from("/var/lib/portalsync/graph.json"));
        assert_eq!(config.net.base_url, "https://portal.example/api");
        assert_eq!(config.net.max_connections, 8);
        assert_eq!(config.net.chunk_size, 25);
        assert_eq!(config.net.retry.max_tries, 5);

        let account = config.account(env(&[])).unwrap();
        assert_eq!(account.username, "nurse");
        assert_eq!(account.token, "from-file");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portalsync.toml");
        std::fs::write(&path, "").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert!(config.graph_path.ends_with("portalsync/graph.json"));
        assert!(config.media_dir.ends_with("portalsync/media"));
        assert_eq!(config.net, NetConfig::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn environment_overrides_file_credentials() {
        let config: AppConfig = toml::from_str(
            r#"
            [account]
            username = "nurse"
            token = "from-file"
            "#,
        )
        .unwrap();
        let account = config
            .account(env(&[(TOKEN_VAR, "from-env")]))
            .unwrap();
        assert_eq!(account.username, "nurse");
        assert_eq!(account.token, "from-env");
    }

    #[test]
    fn missing_credentials_are_reported() {
        let config = AppConfig::default();
        let err = config.account(env(&[(USER_VAR, "nurse")])).unwrap_err();
        assert!(err.to_string().contains(TOKEN_VAR));
    }
}
