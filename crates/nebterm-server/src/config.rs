//! Server configuration: TOML file + CLI overrides.

use nebterm_core::{TermError, TermResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            working_dir: None,
            cert: None,
            key: None,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Shared token-signing secret.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_port() -> u16 {
    8080
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}

/// Directory new shells start in when none is configured.
pub fn default_working_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("workspace"))
        .unwrap_or_else(std::env::temp_dir)
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub working_dir: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub secret: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub working_dir: PathBuf,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub secret: Option<Vec<u8>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: default_port(),
            working_dir: default_working_dir(),
            cert_path: None,
            key_path: None,
            secret: None,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: ConfigOverrides) -> TermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::merge(file_config, cli)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn merge(file: ConfigFile, cli: ConfigOverrides) -> TermResult<Self> {
        let port = cli.port.unwrap_or(file.server.port);
        let bind_str = cli.bind.unwrap_or(file.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| TermError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;

        let working_dir = cli
            .working_dir
            .or(file.server.working_dir)
            .map(|s| expand_tilde_str(&s))
            .unwrap_or_else(default_working_dir);

        let cert_path = cli.cert.or(file.server.cert).map(|s| expand_tilde_str(&s));
        let key_path = cli.key.or(file.server.key).map(|s| expand_tilde_str(&s));
        if cert_path.is_some() != key_path.is_some() {
            return Err(TermError::Config(
                "cert and key must be given together".into(),
            ));
        }

        let secret = cli
            .secret
            .or(file.auth.secret)
            .filter(|s| !s.is_empty())
            .map(String::into_bytes);

        Ok(Self {
            bind,
            port,
            working_dir,
            cert_path,
            key_path,
            secret,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

fn parse_config(content: &str) -> TermResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TermError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::merge(ConfigFile::default(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.working_dir, default_working_dir());
        assert!(!config.tls_enabled());
        assert!(config.secret.is_none());
    }

    #[test]
    fn parses_file() {
        let file = parse_config(
            r#"
            [server]
            port = 9000
            bind = "127.0.0.1"
            working_dir = "/srv/work"
            cert = "/etc/nebterm/cert.pem"
            key = "/etc/nebterm/key.pem"

            [auth]
            secret = "s3cret"
            "#,
        )
        .unwrap();
        let config = ServerConfig::merge(file, ConfigOverrides::default()).unwrap();
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.working_dir, PathBuf::from("/srv/work"));
        assert!(config.tls_enabled());
        assert_eq!(config.secret.as_deref(), Some(&b"s3cret"[..]));
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse_config("[server]\nport = 9000\n[auth]\nsecret = \"file\"\n").unwrap();
        let cli = ConfigOverrides {
            port: Some(7000),
            working_dir: Some("/tmp/other".into()),
            secret: Some("cli".into()),
            ..Default::default()
        };
        let config = ServerConfig::merge(file, cli).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.working_dir, PathBuf::from("/tmp/other"));
        assert_eq!(config.secret.as_deref(), Some(&b"cli"[..]));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_config("[server]\nport = \"eighty\"\n").is_err());

        let cli = ConfigOverrides {
            bind: Some("not-an-ip".into()),
            ..Default::default()
        };
        assert!(ServerConfig::merge(ConfigFile::default(), cli).is_err());

        let cli = ConfigOverrides {
            cert: Some("/tmp/cert.pem".into()),
            ..Default::default()
        };
        assert!(ServerConfig::merge(ConfigFile::default(), cli).is_err());
    }

    #[test]
    fn empty_secret_counts_as_unset() {
        let file = parse_config("[auth]\nsecret = \"\"\n").unwrap();
        let config = ServerConfig::merge(file, ConfigOverrides::default()).unwrap();
        assert!(config.secret.is_none());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();
        let config = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 9100);

        let missing = dir.path().join("missing.toml");
        let config = ServerConfig::load(Some(&missing), ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn expands_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/workspace"), home.join("workspace"));
        }
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde_str("rel~/x"), PathBuf::from("rel~/x"));
    }
}
