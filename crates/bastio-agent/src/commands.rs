//! Command handlers for the agent CLI.
//!
//! Each handler resolves its configuration (file plus flags), performs the
//! command, and returns an [`AgentResult`]; the binary turns errors into an
//! `error: …` line on stderr and exit code 1.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use crate::accounts::AccountManager;
use crate::config::{self, AgentConfig, CliOverrides, FileSettings};
use crate::connector::{BackendConnector, ConnectorConfig};
use crate::enroll::EnrollmentClient;
use crate::error::{AgentError, AgentResult};
use crate::keys;
use crate::pool::Pool;
use crate::processor::Processor;

/// How long shutdown waits for the pool to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

fn load_file_settings(path: Option<&Path>) -> AgentResult<FileSettings> {
    match path {
        Some(path) => FileSettings::load(path),
        None => Ok(FileSettings::default()),
    }
}

fn require_key_path(
    flag: Option<PathBuf>,
    file: Option<PathBuf>,
) -> AgentResult<PathBuf> {
    flag.or(file).ok_or_else(|| {
        AgentError::config(
            "an agent key is required (pass --agent-key or set `agentkey` in the configuration file)",
        )
    })
}

/// `generate-key`: write a fresh RSA private key to the configured path.
pub async fn handle_generate_key(
    config_path: Option<&Path>,
    agent_key: Option<PathBuf>,
    bits: usize,
) -> AgentResult<()> {
    let file = load_file_settings(config_path)?;
    let key_path = require_key_path(agent_key, file.agentkey)?;

    let pem = tokio::task::spawn_blocking(move || keys::generate_rsa_pem(bits))
        .await
        .map_err(|e| AgentError::task(format!("key generation task failed: {e}")))??;
    keys::write_private_key_file(&key_path, &pem)?;

    println!("generated {bits}-bit key successfully");
    Ok(())
}

/// `upload-key`: post the agent public key (optionally replacing an old one)
/// to the backend's enrollment endpoint.
pub async fn handle_upload_key(
    config_path: Option<&Path>,
    agent_key: Option<PathBuf>,
    api_key: Option<String>,
    new_agent_key: Option<PathBuf>,
) -> AgentResult<()> {
    let file = load_file_settings(config_path)?;
    let key_path = require_key_path(agent_key, file.agentkey)?;
    config::check_key_file(&key_path)?;
    let api_key = api_key.or(file.apikey).ok_or_else(|| {
        AgentError::config(
            "an API key is required (pass --api-key or set `apikey` in the configuration file)",
        )
    })?;
    let api_url = file
        .apiurl
        .unwrap_or_else(|| config::DEFAULT_API_URL.to_string());

    let current = keys::load_private_key(&key_path)?;
    let current_public = keys::public_openssh(&current)?;
    let client = EnrollmentClient::new(api_url)?;

    match new_agent_key {
        Some(new_path) => {
            config::check_key_file(&new_path)?;
            let new_key = keys::load_private_key(&new_path)?;
            let new_public = keys::public_openssh(&new_key)?;
            client
                .upload_public_key(&api_key, &new_public, Some(&current_public))
                .await?;
        }
        None => {
            client
                .upload_public_key(&api_key, &current_public, None)
                .await?;
        }
    }

    println!("uploaded public key successfully");
    Ok(())
}

/// `start`: run the agent in the foreground until SIGINT/SIGTERM.
pub async fn handle_start(config_path: Option<&Path>, cli: CliOverrides) -> AgentResult<()> {
    let file = load_file_settings(config_path)?;
    let cfg = AgentConfig::resolve(file, cli)?;
    config::check_key_file(&cfg.agent_key_path)?;
    let key = Arc::new(keys::load_private_key(&cfg.agent_key_path)?);

    let enrollment = EnrollmentClient::new(cfg.api_url.clone())?;
    let backend_hostkey = enrollment.download_backend_hostkey().await?;

    let pool = Pool::new(cfg.min_workers);
    let (processor, endpoint) = Processor::new(AccountManager::new());
    processor.start(&pool);

    let connector = BackendConnector::new(ConnectorConfig::new(
        cfg.host.clone(),
        cfg.port,
        cfg.api_key.clone(),
        key,
        backend_hostkey,
    ));
    connector.register(endpoint);
    connector.start(&pool);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cfg.host,
        port = cfg.port,
        "bastio agent started"
    );

    shutdown_signal().await;
    info!("signal received, shutting down");

    connector.stop();
    processor.stop();
    if !pool.remove_all_workers(Some(SHUTDOWN_TIMEOUT)).await {
        error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "graceful shutdown timed out; exiting anyway"
        );
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
