//! # Agent Configuration
//!
//! Typed configuration resolved from three layers, later layers winning:
//! built-in defaults, the `[agent]` section of an INI configuration file,
//! and explicit command-line flags. The known option set is the schema —
//! there is no reflective lookup.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AgentError, AgentResult};
use crate::keys;

pub const DEFAULT_HOST: &str = "backend.bastio.com";
pub const DEFAULT_PORT: u16 = 2357;
pub const DEFAULT_MIN_WORKERS: usize = 3;
pub const DEFAULT_API_URL: &str = "https://bastio.com/api/external";

/// The `[agent]` section of the configuration file. Every key is optional;
/// resolution fills in defaults and applies CLI overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub agentkey: Option<PathBuf>,
    pub apikey: Option<String>,
    pub minworkers: Option<usize>,
    pub apiurl: Option<String>,
}

impl FileSettings {
    /// Load the `[agent]` section from an INI file. A file without that
    /// section yields empty settings; an unreadable or unparsable file is a
    /// configuration error.
    pub fn load(path: &Path) -> AgentResult<Self> {
        if !path.exists() {
            return Err(AgentError::config(format!(
                "configuration file `{}` does not exist",
                path.display()
            )));
        }
        let loaded = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()
            .map_err(|e| {
                AgentError::config(format!(
                    "could not load configuration file `{}`: {e}",
                    path.display()
                ))
            })?;
        match loaded.get::<FileSettings>("agent") {
            Ok(settings) => Ok(settings),
            Err(config::ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(AgentError::config(format!(
                "invalid `[agent]` section in `{}`: {e}",
                path.display()
            ))),
        }
    }
}

/// Values taken from command-line flags; `None` means the flag was not given.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub min_workers: Option<usize>,
    pub api_key: Option<String>,
    pub agent_key: Option<PathBuf>,
}

/// Fully resolved configuration for the `start` command.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub agent_key_path: PathBuf,
    pub api_key: String,
    pub min_workers: usize,
    pub api_url: String,
}

impl AgentConfig {
    pub fn resolve(file: FileSettings, cli: CliOverrides) -> AgentResult<Self> {
        let api_key = cli.api_key.or(file.apikey).ok_or_else(|| {
            AgentError::config(
                "an API key is required (pass --api-key or set `apikey` in the configuration file)",
            )
        })?;
        let agent_key_path = cli.agent_key.or(file.agentkey).ok_or_else(|| {
            AgentError::config(
                "an agent key is required (pass --agent-key or set `agentkey` in the configuration file)",
            )
        })?;
        Ok(Self {
            host: cli
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            agent_key_path,
            api_key,
            min_workers: cli
                .min_workers
                .or(file.minworkers)
                .unwrap_or(DEFAULT_MIN_WORKERS),
            api_url: file.apiurl.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        })
    }
}

/// Preflight a private key file: it must exist, be readable, and parse.
pub fn check_key_file(path: &Path) -> AgentResult<()> {
    if !path.exists() {
        return Err(AgentError::config(format!(
            "agent key file `{}` does not exist",
            path.display()
        )));
    }
    if std::fs::File::open(path).is_err() {
        return Err(AgentError::config(format!(
            "permission to read the agent key file `{}` is denied",
            path.display()
        )));
    }
    if !keys::validate_private_key_file(path) {
        return Err(AgentError::config(format!(
            "agent key file `{}` is invalid",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.ini");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_full_section() {
        let (_dir, path) = write_ini(
            "[agent]\n\
             host = backend.example.com\n\
             port = 4222\n\
             agentkey = /etc/bastio/agent.pem\n\
             apikey = deadbeef\n\
             minworkers = 5\n",
        );
        let settings = FileSettings::load(&path).unwrap();
        assert_eq!(settings.host.as_deref(), Some("backend.example.com"));
        assert_eq!(settings.port, Some(4222));
        assert_eq!(
            settings.agentkey.as_deref(),
            Some(Path::new("/etc/bastio/agent.pem"))
        );
        assert_eq!(settings.apikey.as_deref(), Some("deadbeef"));
        assert_eq!(settings.minworkers, Some(5));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FileSettings::load(Path::new("/nonexistent/agent.ini")).unwrap_err();
        assert!(matches!(err, AgentError::Config(m) if m.contains("does not exist")));
    }

    #[test]
    fn test_load_without_agent_section() {
        let (_dir, path) = write_ini("[other]\nkey = value\n");
        let settings = FileSettings::load(&path).unwrap();
        assert!(settings.host.is_none());
        assert!(settings.apikey.is_none());
    }

    #[test]
    fn test_resolve_defaults() {
        let cfg = AgentConfig::resolve(
            FileSettings {
                apikey: Some("k".into()),
                agentkey: Some("/tmp/key.pem".into()),
                ..Default::default()
            },
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.min_workers, DEFAULT_MIN_WORKERS);
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_resolve_cli_overrides_file() {
        let file = FileSettings {
            host: Some("file.example.com".into()),
            port: Some(1111),
            apikey: Some("filekey".into()),
            agentkey: Some("/file/key.pem".into()),
            minworkers: Some(2),
            apiurl: None,
        };
        let cli = CliOverrides {
            host: Some("cli.example.com".into()),
            port: None,
            min_workers: Some(7),
            api_key: None,
            agent_key: None,
        };
        let cfg = AgentConfig::resolve(file, cli).unwrap();
        assert_eq!(cfg.host, "cli.example.com");
        assert_eq!(cfg.port, 1111);
        assert_eq!(cfg.min_workers, 7);
        assert_eq!(cfg.api_key, "filekey");
        assert_eq!(cfg.agent_key_path, PathBuf::from("/file/key.pem"));
    }

    #[test]
    fn test_resolve_requires_api_key() {
        let err = AgentConfig::resolve(
            FileSettings {
                agentkey: Some("/tmp/key.pem".into()),
                ..Default::default()
            },
            CliOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(m) if m.contains("API key")));
    }

    #[test]
    fn test_resolve_requires_agent_key() {
        let err = AgentConfig::resolve(
            FileSettings {
                apikey: Some("k".into()),
                ..Default::default()
            },
            CliOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(m) if m.contains("agent key")));
    }

    #[test]
    fn test_check_key_file_missing() {
        let err = check_key_file(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, AgentError::Config(m) if m.contains("does not exist")));
    }

    #[test]
    fn test_check_key_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        std::fs::write(&path, "garbage").unwrap();
        let err = check_key_file(&path).unwrap_err();
        assert!(matches!(err, AgentError::Config(m) if m.contains("is invalid")));
    }
}
