//! Client configuration.
//!
//! Layers, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `~/.clawgate/config.toml` (or an explicit path), `[gateway]` table
//! 3. `~/.clawgate/onboarding.json` written by the onboarding flow
//!    (`{"gatewayUrl": …, "gatewayToken": …}`)
//! 4. `CLAWGATE_GATEWAY_URL` / `CLAWGATE_GATEWAY_TOKEN`
//!
//! Command-line flags are applied on top by the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::protocol::{
    AuthParams, ClientInfo, ConnectParams, DEFAULT_ROLE, ProtocolRange,
};

pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:18789";
/// Development token accepted by a stock local gateway.
pub const DEFAULT_GATEWAY_TOKEN: &str = "openclaw-admin-token";
/// Origin presented on the upgrade request; the gateway's control-UI check
/// only admits its own origin.
pub const DEFAULT_ORIGIN: &str = "http://localhost:18789";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_GATEWAY_URL: &str = "CLAWGATE_GATEWAY_URL";
pub const ENV_GATEWAY_TOKEN: &str = "CLAWGATE_GATEWAY_TOKEN";

const CONFIG_FILE: &str = "config.toml";
const ONBOARDING_FILE: &str = "onboarding.json";

/// Connection settings for one [`GatewayClient`](crate::gateway::GatewayClient).
///
/// Fixed once the client is constructed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Bearer token presented during the handshake.
    pub auth_token: String,
    /// Value of the `Origin` header on the upgrade request.
    pub origin: String,
    /// Seconds to wait for a response; `0` waits forever.
    pub request_timeout_secs: u64,
    /// Role requested in the handshake.
    pub role: String,
    pub protocol: ProtocolRange,
    pub client: ClientIdentity,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            auth_token: DEFAULT_GATEWAY_TOKEN.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            role: DEFAULT_ROLE.to_string(),
            protocol: ProtocolRange::default(),
            client: ClientIdentity::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("auth_token", &"***")
            .field("origin", &self.origin)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .field("client", &self.client)
            .finish()
    }
}

/// How this client describes itself to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub device_family: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            id: "webchat".to_string(),
            display_name: "OpenClaw OS".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: "web".to_string(),
            mode: "ui".to_string(),
            device_family: "browser".to_string(),
        }
    }
}

impl From<&ClientIdentity> for ClientInfo {
    fn from(identity: &ClientIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            version: identity.version.clone(),
            platform: identity.platform.clone(),
            mode: identity.mode.clone(),
            device_family: identity.device_family.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigFile {
    #[serde(default)]
    gateway: ClientConfig,
}

/// Record persisted by the onboarding flow.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardingRecord {
    #[serde(default)]
    gateway_url: Option<String>,
    #[serde(default)]
    gateway_token: Option<String>,
}

/// Default settings directory (`~/.clawgate`).
pub fn settings_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clawgate")
}

impl ClientConfig {
    /// A config for `url` and `auth_token` with every other setting at its default.
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
            ..Self::default()
        }
    }

    /// Resolve every layer: file, onboarding record, environment.
    pub fn resolve(path: Option<PathBuf>) -> Result<Self, GatewayError> {
        let mut config = Self::load(path)?;
        config.apply_onboarding(&settings_dir().join(ONBOARDING_FILE));
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load the `[gateway]` table from a TOML file. A missing file yields defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self, GatewayError> {
        let config_path = path.unwrap_or_else(|| settings_dir().join(CONFIG_FILE));
        if !config_path.exists() {
            debug!(path = %config_path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", config_path.display()))
        })?;
        let file: ConfigFile = toml::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("cannot parse {}: {e}", config_path.display()))
        })?;
        Ok(file.gateway)
    }

    /// Write the config as a `[gateway]` table.
    pub fn save(&self, path: &Path) -> Result<(), GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let content = toml::to_string_pretty(&ConfigFile {
            gateway: self.clone(),
        })
        .map_err(|e| GatewayError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| GatewayError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Overlay the onboarding record at `path`. Returns whether anything changed.
    ///
    /// A missing or malformed record is ignored.
    pub fn apply_onboarding(&mut self, path: &Path) -> bool {
        let Ok(content) = std::fs::read_to_string(path) else {
            return false;
        };
        let record: OnboardingRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "ignoring malformed onboarding record");
                return false;
            }
        };
        let mut changed = false;
        if let Some(url) = record.gateway_url.filter(|u| !u.is_empty()) {
            self.url = url;
            changed = true;
        }
        if let Some(token) = record.gateway_token.filter(|t| !t.is_empty()) {
            self.auth_token = token;
            changed = true;
        }
        changed
    }

    /// Overlay environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_GATEWAY_URL).filter(|u| !u.is_empty()) {
            self.url = url;
        }
        if let Some(token) = lookup(ENV_GATEWAY_TOKEN).filter(|t| !t.is_empty()) {
            self.auth_token = token;
        }
    }

    /// Check the settings a client cannot work without.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| GatewayError::Config(format!("invalid gateway url {:?}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(GatewayError::Config(format!(
                "gateway url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if !self.protocol.is_valid() {
            return Err(GatewayError::Config(format!(
                "protocol range {}..={} is empty",
                self.protocol.min, self.protocol.max
            )));
        }
        if self.origin.is_empty() {
            return Err(GatewayError::Config("origin must not be empty".into()));
        }
        Ok(())
    }

    /// `None` means wait indefinitely.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Parameters of the handshake request.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            min_protocol: self.protocol.min,
            max_protocol: self.protocol.max,
            role: self.role.clone(),
            client: ClientInfo::from(&self.client),
            auth: AuthParams {
                token: self.auth_token.clone(),
            },
        }
    }
}
