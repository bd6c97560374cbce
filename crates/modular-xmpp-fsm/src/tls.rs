//! TLS client context for transports that secure the stream.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::ConfigurationError;

/// rustls client configuration shared by a connection's transports.
#[derive(Debug, Clone)]
pub struct TlsContext {
    client_config: Arc<rustls::ClientConfig>,
}

impl TlsContext {
    /// Build the context from the `[tls]` configuration section. Returns
    /// `None` when no trust anchors are configured.
    pub fn from_config(config: &TlsConfig) -> Result<Option<Self>, ConfigurationError> {
        match &config.ca_file {
            Some(path) => Self::from_ca_file(path).map(Some),
            None => Ok(None),
        }
    }

    pub fn from_ca_file(path: &Path) -> Result<Self, ConfigurationError> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_ca_pem(&pem)
    }

    /// Build a context trusting the certificates in `ca_pem`.
    pub fn from_ca_pem(ca_pem: &str) -> Result<Self, ConfigurationError> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certs(ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| ConfigurationError::Tls(format!("invalid CA certificate: {e}")))?;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigurationError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!("built client TLS config");
        Ok(Self {
            client_config: Arc::new(client_config),
        })
    }

    #[must_use]
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.client_config)
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigurationError::Tls(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ConfigurationError::Tls(
            "no certificates found in PEM".to_string(),
        ));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ca_file_means_no_context() {
        assert!(TlsContext::from_config(&TlsConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_pem_is_rejected() {
        let err = TlsContext::from_ca_pem("").unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn missing_ca_file_is_io_error() {
        let config = TlsConfig {
            ca_file: Some("/nonexistent/modular-xmpp/ca.pem".into()),
        };
        assert!(matches!(
            TlsContext::from_config(&config),
            Err(ConfigurationError::Io(_))
        ));
    }
}
