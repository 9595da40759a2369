//! Agent configuration.
//!
//! Loaded with priority:
//! 1. Environment variables (`CAMDEPLOY_*`)
//! 2. Config file (`~/.config/camdeploy/config.toml`)
//! 3. Default values

use crate::deploy::{
    DeploySettings, DeployTimings, DirectorySource, GithubReleaseSource, LicenseSigner, NoSigner,
    Orchestrator, PackageSource, RemoteLicenseSigner, StaticLicense,
};
use crate::http::{DeviceClient, ReqwestTransport, RetryPolicy};
use crate::scanner::{ScanOptions, Scanner};
use crate::tls::{CertificateStore, PinPolicy, default_pin_store_path};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9876;

const ENV_PORT: &str = "CAMDEPLOY_PORT";
const ENV_BIND: &str = "CAMDEPLOY_BIND";
const ENV_PIN_POLICY: &str = "CAMDEPLOY_PIN_POLICY";
const ENV_RELEASE_URL: &str = "CAMDEPLOY_RELEASE_URL";
const ENV_SIGNER_URL: &str = "CAMDEPLOY_SIGNER_URL";

/// Where the configuration came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    #[default]
    Default,
    /// Loaded from config file
    ConfigFile,
    /// At least one value overridden by an environment variable
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::ConfigFile => write!(f, "config file"),
            ConfigSource::Environment => write!(f, "environment variable"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
    /// Origins allowed to call the local service. `chrome-extension://`
    /// origins are always allowed.
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "https://anava-ai.web.app".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub pin_policy: PinPolicy,
    pub pin_store: Option<PathBuf>,
}

impl TlsConfig {
    pub fn pin_store_path(&self) -> Option<PathBuf> {
        self.pin_store.clone().or_else(default_pin_store_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub probe_timeout_secs: u64,
    pub max_hosts: usize,
    pub scheme: String,
    pub cameras_only: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let options = ScanOptions::default();
        Self {
            batch_size: options.batch_size,
            probe_timeout_secs: options.probe_timeout.as_secs(),
            max_hosts: options.max_hosts,
            scheme: options.scheme,
            cameras_only: options.cameras_only,
        }
    }
}

impl ScanConfig {
    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            batch_size: self.batch_size.max(1),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs.max(1)),
            max_hosts: self.max_hosts.max(1),
            scheme: self.scheme.clone(),
            cameras_only: self.cameras_only,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Release manifest URL, or a local directory of package files.
    pub release_manifest_url: Option<String>,
    pub app_name: String,
    pub license_signer_url: Option<String>,
    pub license_settle_secs: u64,
    pub start_poll_secs: u64,
    pub config_retry_secs: u64,
    pub upload_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Devices provisioned at once.
    pub concurrency: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            release_manifest_url: None,
            app_name: "BatonAnalytic".to_string(),
            license_signer_url: None,
            license_settle_secs: 3,
            start_poll_secs: 3,
            config_retry_secs: 5,
            upload_timeout_secs: 300,
            request_timeout_secs: 30,
            concurrency: 4,
        }
    }
}

impl DeployConfig {
    pub fn settings(&self, scheme: &str) -> DeploySettings {
        DeploySettings {
            app_name: self.app_name.clone(),
            scheme: scheme.to_string(),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            timings: DeployTimings {
                license_settle: Duration::from_secs(self.license_settle_secs),
                start_poll: Duration::from_secs(self.start_poll_secs),
                config_retry: Duration::from_secs(self.config_retry_secs),
            },
            ..DeploySettings::default()
        }
    }

    pub fn package_source(&self) -> Arc<dyn PackageSource> {
        match self.release_manifest_url.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Arc::new(GithubReleaseSource::new(url))
            }
            Some(dir) => Arc::new(DirectorySource::new(dir)),
            None => Arc::new(DirectorySource::new(default_package_dir())),
        }
    }

    pub fn license_signer(&self) -> Arc<dyn LicenseSigner> {
        match &self.license_signer_url {
            Some(url) => Arc::new(RemoteLicenseSigner::new(url.clone())),
            None => Arc::new(NoSigner),
        }
    }
}

fn default_package_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .map(|d| d.join("camdeploy").join("packages"))
        .unwrap_or_else(|| PathBuf::from("packages"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub service: ServiceConfig,
    pub tls: TlsConfig,
    pub scan: ScanConfig,
    pub deploy: DeployConfig,
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Clients and stores shared by the scanner and orchestrator.
#[derive(Clone)]
pub struct DeviceStack {
    pub pins: Arc<CertificateStore>,
    pub client: DeviceClient,
    pub upload_client: DeviceClient,
}

impl AgentConfig {
    pub fn pin_store(&self) -> Arc<CertificateStore> {
        match self.tls.pin_store_path() {
            Some(path) => Arc::new(CertificateStore::open(path)),
            None => {
                tracing::warn!("No data directory; certificate pins kept in memory only");
                Arc::new(CertificateStore::in_memory())
            }
        }
    }

    /// Build the pinned transports. Regular calls and uploads get separate
    /// timeout budgets.
    pub fn device_stack(&self) -> Result<DeviceStack> {
        let pins = self.pin_store();
        let regular = ReqwestTransport::new(
            pins.clone(),
            self.tls.pin_policy,
            Duration::from_secs(self.deploy.request_timeout_secs),
        )
        .context("Failed to build HTTP client")?;
        let upload = ReqwestTransport::new(
            pins.clone(),
            self.tls.pin_policy,
            Duration::from_secs(self.deploy.upload_timeout_secs),
        )
        .context("Failed to build upload client")?;

        Ok(DeviceStack {
            pins,
            client: DeviceClient::new(Arc::new(regular)).with_retry(RetryPolicy::default()),
            upload_client: DeviceClient::new(Arc::new(upload)).with_retry(RetryPolicy::default()),
        })
    }

    pub fn scanner(&self, stack: &DeviceStack) -> Scanner {
        Scanner::new(stack.client.clone(), self.scan.options())
    }

    /// Orchestrator with the configured package source. A pre-signed license
    /// replaces the configured signer.
    pub fn orchestrator(&self, stack: &DeviceStack, license_xml: Option<String>) -> Orchestrator {
        let signer: Arc<dyn LicenseSigner> = match license_xml {
            Some(xml) => Arc::new(StaticLicense(xml)),
            None => self.deploy.license_signer(),
        };
        Orchestrator::new(
            stack.client.clone(),
            self.deploy.package_source(),
            signer,
            self.deploy.settings(&self.scan.scheme),
        )
        .with_upload_client(stack.upload_client.clone())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut applied = false;

        if let Some(port) = get(ENV_PORT) {
            match port.parse() {
                Ok(port) => {
                    self.service.port = port;
                    applied = true;
                }
                Err(_) => tracing::warn!("Ignoring invalid {}={}", ENV_PORT, port),
            }
        }
        if let Some(bind) = get(ENV_BIND) {
            self.service.bind = bind;
            applied = true;
        }
        if let Some(policy) = get(ENV_PIN_POLICY) {
            match policy.parse() {
                Ok(policy) => {
                    self.tls.pin_policy = policy;
                    applied = true;
                }
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_PIN_POLICY, e),
            }
        }
        if let Some(url) = get(ENV_RELEASE_URL) {
            self.deploy.release_manifest_url = Some(url);
            applied = true;
        }
        if let Some(url) = get(ENV_SIGNER_URL) {
            self.deploy.license_signer_url = Some(url);
            applied = true;
        }

        if applied {
            tracing::info!("Applied configuration overrides from environment");
            self.source = ConfigSource::Environment;
        }
    }
}

/// Get the path to the configuration file
pub fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("camdeploy").join("config.toml"))
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/camdeploy/config.toml".to_string())
}

/// Parse a config file. Missing keys take their defaults.
pub fn load_config_file(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let mut config: AgentConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    config.source = ConfigSource::ConfigFile;
    Ok(config)
}

/// Load configuration from `path` (or the default location), then apply
/// environment overrides. An explicit path must exist; a broken default file
/// is reported and skipped.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match get_config_file_path().filter(|p| p.exists()) {
            Some(default_path) => match load_config_file(&default_path) {
                Ok(config) => {
                    tracing::debug!("Loaded config from {:?}", default_path);
                    config
                }
                Err(e) => {
                    tracing::warn!("{:#}; using defaults", e);
                    AgentConfig::default()
                }
            },
            None => AgentConfig::default(),
        },
    };

    config.apply_env(|key| std::env::var(key).ok());
    tracing::debug!("Configuration source: {}", config.source);
    Ok(config)
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# camdeploy configuration
# Place this file at: ~/.config/camdeploy/config.toml

[service]
# Address and port of the local service (CAMDEPLOY_BIND, CAMDEPLOY_PORT)
# bind = "127.0.0.1"
# port = 9876
# Origins allowed to call the service; chrome-extension:// is always allowed
# allowed_origins = ["http://localhost:5173"]

[tls]
# "warn" logs certificate changes and continues; "enforce" blocks the request
# (CAMDEPLOY_PIN_POLICY)
# pin_policy = "warn"
# pin_store = "/path/to/certificate-pins.json"

[scan]
# batch_size = 50
# probe_timeout_secs = 3
# max_hosts = 256
# scheme = "https"
# cameras_only = false

[deploy]
# Release manifest URL or a directory of .eap files (CAMDEPLOY_RELEASE_URL)
# release_manifest_url = "https://api.github.com/repos/<owner>/<repo>/releases/latest"
# app_name = "BatonAnalytic"
# License signing service (CAMDEPLOY_SIGNER_URL)
# license_signer_url = "https://licensing.example.com/sign"
# license_settle_secs = 3
# start_poll_secs = 3
# config_retry_secs = 5
# upload_timeout_secs = 300
# request_timeout_secs = 30
# concurrency = 4
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.service.port, 9876);
        assert_eq!(config.service.bind, "127.0.0.1");
        assert_eq!(config.tls.pin_policy, PinPolicy::Warn);
        assert_eq!(config.scan.batch_size, 50);
        assert_eq!(config.scan.probe_timeout_secs, 3);
        assert_eq!(config.deploy.upload_timeout_secs, 300);
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[tls]\npin_policy = \"enforce\"\n\n[scan]\ncameras_only = true\n",
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.tls.pin_policy, PinPolicy::Enforce);
        assert!(config.scan.cameras_only);
        assert_eq!(config.scan.batch_size, 50);
        assert_eq!(config.service.port, DEFAULT_PORT);
        assert_eq!(config.source, ConfigSource::ConfigFile);
    }

    #[test]
    fn test_example_config_parses() {
        let config: AgentConfig = toml::from_str(&generate_example_config()).unwrap();
        assert_eq!(config.service.port, DEFAULT_PORT);
    }

    #[test]
    fn test_env_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PORT, "9999"),
            (ENV_PIN_POLICY, "enforce"),
            (ENV_SIGNER_URL, " https://signer.test/sign "),
        ]);
        let mut config = AgentConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.service.port, 9999);
        assert_eq!(config.tls.pin_policy, PinPolicy::Enforce);
        assert_eq!(
            config.deploy.license_signer_url.as_deref(),
            Some("https://signer.test/sign")
        );
        assert_eq!(config.source, ConfigSource::Environment);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = AgentConfig::default();
        config.apply_env(|k| match k {
            ENV_PORT => Some("ninety".to_string()),
            ENV_PIN_POLICY => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(config.service.port, DEFAULT_PORT);
        assert_eq!(config.tls.pin_policy, PinPolicy::Warn);
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config(Some(Path::new("/nonexistent/camdeploy.toml"))).is_err());
    }

    #[test]
    fn test_deploy_settings_from_config() {
        let settings = DeployConfig::default().settings("http");
        assert_eq!(settings.scheme, "http");
        assert_eq!(settings.app_name, "BatonAnalytic");
        assert_eq!(settings.timings.config_retry, Duration::from_secs(5));
    }
}
