//! Connection configuration.
//!
//! [`ConnectionConfig`] holds the plain settings loaded from TOML.
//! [`ConnectionConfiguration`] combines them with the modules and the state
//! descriptor graph built from the core and module descriptors; it is
//! built once and shared by every connection created from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use modular_xmpp_types::{LoginContext, Resource, ResourceError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigurationError;
use crate::graph::StateDescriptorGraph;
use crate::module::ModuleDescriptor;
use crate::states::core_descriptors;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl ConnectionConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigurationError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        debug!(path = %path.display(), "loaded connection configuration");
        Ok(config)
    }

    /// Check the settings that would make a connection unusable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection.xmpp_domain.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "xmpp_domain must not be empty".to_string(),
            ));
        }
        if self.connection.reply_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid(
                "reply_timeout_ms must be positive".to_string(),
            ));
        }
        if self.connection.outgoing_queue_capacity == 0 {
            return Err(ConfigurationError::Invalid(
                "outgoing_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// When TLS is used for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Required,
    IfPossible,
    Disabled,
}

/// Server and stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_xmpp_domain")]
    pub xmpp_domain: String,
    /// Connect to this host instead of looking up the domain's endpoints.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_outgoing_queue_capacity")]
    pub outgoing_queue_capacity: usize,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ConnectionSettings {
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            xmpp_domain: default_xmpp_domain(),
            host: None,
            port: default_port(),
            reply_timeout_ms: default_reply_timeout_ms(),
            outgoing_queue_capacity: default_outgoing_queue_capacity(),
            language: None,
            security_mode: SecurityMode::default(),
            compression: false,
            log_level: default_log_level(),
        }
    }
}

/// Credentials used when no login context is passed explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

impl LoginConfig {
    /// The configured credentials, if both username and password are set.
    pub fn login_context(&self) -> Result<Option<LoginContext>, ResourceError> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            return Ok(None);
        };
        let mut login = LoginContext::new(username, password);
        if let Some(resource) = &self.resource {
            login = login.with_resource(Resource::new(resource.clone())?);
        }
        Ok(Some(login))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the trust anchors for the server certificate.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_xmpp_domain() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5222
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

fn default_outgoing_queue_capacity() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings, modules and the state descriptor graph of a connection.
pub struct ConnectionConfiguration {
    config: ConnectionConfig,
    modules: Vec<Arc<dyn ModuleDescriptor>>,
    graph: StateDescriptorGraph,
}

impl ConnectionConfiguration {
    #[must_use]
    pub fn builder(config: ConnectionConfig) -> ConnectionConfigurationBuilder {
        ConnectionConfigurationBuilder {
            config,
            modules: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn modules(&self) -> &[Arc<dyn ModuleDescriptor>] {
        &self.modules
    }

    #[must_use]
    pub fn state_descriptor_graph(&self) -> &StateDescriptorGraph {
        &self.graph
    }
}

impl std::fmt::Debug for ConnectionConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfiguration")
            .field("config", &self.config)
            .field(
                "modules",
                &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("states", &self.graph.len())
            .finish()
    }
}

pub struct ConnectionConfigurationBuilder {
    config: ConnectionConfig,
    modules: Vec<Arc<dyn ModuleDescriptor>>,
}

impl ConnectionConfigurationBuilder {
    #[must_use]
    pub fn add_module(mut self, module: impl ModuleDescriptor) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Validate the settings and build the state descriptor graph.
    pub fn build(self) -> Result<Arc<ConnectionConfiguration>, ConfigurationError> {
        self.config.validate()?;

        let mut descriptors = core_descriptors();
        let mut names: Vec<&'static str> = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            if names.contains(&module.name()) {
                return Err(ConfigurationError::DuplicateModule(module.name().to_string()));
            }
            names.push(module.name());
            descriptors.extend(module.state_descriptors());
        }
        let graph = StateDescriptorGraph::build(descriptors)?;
        debug!(modules = ?names, states = graph.len(), "built connection configuration");

        Ok(Arc::new(ConnectionConfiguration {
            config: self.config,
            modules: self.modules,
            graph,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = ConnectionConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("port = 5222"));
        assert!(toml_str.contains("outgoing_queue_capacity = 100"));
        assert!(toml_str.contains("security_mode = \"required\""));
    }

    #[test]
    fn parse_example_config() {
        let toml_str = r#"
[connection]
xmpp_domain = "example.org"
host = "xmpp.example.org"
port = 5223
reply_timeout_ms = 2500
security_mode = "if_possible"
compression = true
log_level = "debug"

[login]
username = "juliet"
password = "r0m30"
resource = "balcony"

[tls]
ca_file = "/etc/modular-xmpp/ca.pem"
"#;
        let config = ConnectionConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.connection.xmpp_domain, "example.org");
        assert_eq!(config.connection.host.as_deref(), Some("xmpp.example.org"));
        assert_eq!(config.connection.port, 5223);
        assert_eq!(config.connection.reply_timeout(), Duration::from_millis(2500));
        assert_eq!(config.connection.outgoing_queue_capacity, 100);
        assert_eq!(config.connection.security_mode, SecurityMode::IfPossible);
        assert!(config.connection.compression);
        assert_eq!(
            config.tls.ca_file.as_deref(),
            Some(Path::new("/etc/modular-xmpp/ca.pem"))
        );

        let login = config.login.login_context().unwrap().unwrap();
        assert_eq!(login.username, "juliet");
        assert_eq!(login.resource.unwrap().as_str(), "balcony");
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config = ConnectionConfig::from_toml_str("[connection]\nxmpp_domain = \"example.net\"\n")
            .unwrap();
        assert_eq!(config.connection.port, 5222);
        assert_eq!(config.connection.reply_timeout_ms, 5000);
        assert!(!config.connection.compression);
        assert!(config.login.login_context().unwrap().is_none());
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = ConnectionConfig::default();
        config.connection.reply_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigurationError::Invalid(_))));

        let mut config = ConnectionConfig::default();
        config.connection.xmpp_domain = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigurationError::Invalid(_))));

        let err = ConnectionConfig::from_toml_str("[connection]\nport = \"high\"\n").unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse(_)));
    }

    #[test]
    fn configuration_without_transport_fails() {
        let err = ConnectionConfiguration::builder(ConnectionConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::NoSuccessor(_)));
    }
}
