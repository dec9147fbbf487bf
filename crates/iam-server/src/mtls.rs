//! TLS configuration for the IAM listeners and the node client
//!
//! The public listener serves a TLS identity only. The protected listener
//! additionally verifies client certificates against the configured CA.

use std::path::Path;

use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use zeroize::Zeroizing;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Certificate or CA file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// Key parsing error
    #[error("key parsing error: {0}")]
    KeyParseError(String),
}

fn read_pem(path: &Path) -> Result<String, MtlsError> {
    std::fs::read_to_string(path).map_err(|source| MtlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn check_certificates(pem_text: &str) -> Result<(), MtlsError> {
    let blocks = pem::parse_many(pem_text.as_bytes())
        .map_err(|e| MtlsError::CertificateParseError(e.to_string()))?;

    if !blocks.iter().any(|block| block.tag() == "CERTIFICATE") {
        return Err(MtlsError::CertificateParseError(
            "no CERTIFICATE block found".to_string(),
        ));
    }

    Ok(())
}

fn check_key(pem_text: &str) -> Result<(), MtlsError> {
    let block = pem::parse(pem_text.as_bytes()).map_err(|e| MtlsError::KeyParseError(e.to_string()))?;

    if !block.tag().ends_with("PRIVATE KEY") {
        return Err(MtlsError::KeyParseError(format!(
            "unexpected PEM block {}",
            block.tag()
        )));
    }

    Ok(())
}

/// Server-side TLS configuration
pub struct ServerTls {
    /// Server certificate chain PEM
    pub cert_pem: String,
    /// Server private key PEM (zeroized on drop)
    pub key_pem: Zeroizing<String>,
    /// CA used to verify client certificates; `None` disables client auth
    pub client_ca_pem: Option<String>,
}

impl ServerTls {
    /// Create a config from PEM text, validating each block
    pub fn new(
        cert_pem: String,
        key_pem: Zeroizing<String>,
        client_ca_pem: Option<String>,
    ) -> Result<Self, MtlsError> {
        check_certificates(&cert_pem)?;
        check_key(&key_pem)?;
        if let Some(ca) = &client_ca_pem {
            check_certificates(ca)?;
        }

        Ok(Self {
            cert_pem,
            key_pem,
            client_ca_pem,
        })
    }

    /// Load a config from PEM files
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: Option<&Path>,
    ) -> Result<Self, MtlsError> {
        let cert_pem = read_pem(cert_path)?;
        let key_pem = Zeroizing::new(read_pem(key_path)?);
        let client_ca_pem = client_ca_path.map(read_pem).transpose()?;

        Self::new(cert_pem, key_pem, client_ca_pem)
    }

    /// Whether client certificates are verified
    pub fn is_mutual(&self) -> bool {
        self.client_ca_pem.is_some()
    }

    /// Build a tonic ServerTlsConfig
    pub fn to_tonic_config(&self) -> ServerTlsConfig {
        let identity = Identity::from_pem(&self.cert_pem, self.key_pem.as_bytes());
        let config = ServerTlsConfig::new().identity(identity);

        match &self.client_ca_pem {
            Some(ca) => config.client_ca_root(Certificate::from_pem(ca)),
            None => config,
        }
    }
}

/// Client-side TLS configuration used by secondary nodes
pub struct ClientTls {
    /// CA certificate PEM for verifying the main node
    pub ca_pem: String,
    /// Client certificate and key presented to the protected listener
    pub identity: Option<(String, Zeroizing<String>)>,
    /// Server name to verify, when it differs from the URL host
    pub domain: Option<String>,
}

impl ClientTls {
    /// Server verification only
    pub fn new(ca_pem: String) -> Result<Self, MtlsError> {
        check_certificates(&ca_pem)?;

        Ok(Self {
            ca_pem,
            identity: None,
            domain: None,
        })
    }

    /// Present a client certificate
    pub fn with_identity(
        mut self,
        cert_pem: String,
        key_pem: Zeroizing<String>,
    ) -> Result<Self, MtlsError> {
        check_certificates(&cert_pem)?;
        check_key(&key_pem)?;
        self.identity = Some((cert_pem, key_pem));
        Ok(self)
    }

    /// Override the verified server name
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Build a tonic ClientTlsConfig
    pub fn to_tonic_config(&self) -> ClientTlsConfig {
        let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(&self.ca_pem));

        if let Some((cert, key)) = &self.identity {
            config = config.identity(Identity::from_pem(cert, key.as_bytes()));
        }
        if let Some(domain) = &self.domain {
            config = config.domain_name(domain.clone());
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed() -> (String, Zeroizing<String>) {
        let key = KeyPair::generate().expect("key pair generation should succeed");
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .expect("params should be valid")
            .self_signed(&key)
            .expect("self-signed cert creation should succeed");
        (cert.pem(), Zeroizing::new(key.serialize_pem()))
    }

    #[test]
    fn server_config_accepts_valid_pem() {
        let (cert, key) = self_signed();
        let tls = ServerTls::new(cert.clone(), key, Some(cert)).expect("valid config");
        assert!(tls.is_mutual());
        let _ = tls.to_tonic_config();
    }

    #[test]
    fn server_config_without_ca_is_not_mutual() {
        let (cert, key) = self_signed();
        let tls = ServerTls::new(cert, key, None).expect("valid config");
        assert!(!tls.is_mutual());
    }

    #[test]
    fn key_in_cert_position_is_rejected() {
        let (_, key) = self_signed();
        let result = ServerTls::new(key.to_string(), key, None);
        assert!(matches!(result, Err(MtlsError::CertificateParseError(_))));
    }

    #[test]
    fn cert_in_key_position_is_rejected() {
        let (cert, _) = self_signed();
        let result = ServerTls::new(cert.clone(), Zeroizing::new(cert), None);
        assert!(matches!(result, Err(MtlsError::KeyParseError(_))));
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = ServerTls::from_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            None,
        );
        assert!(matches!(result, Err(MtlsError::Read { .. })));
    }

    #[test]
    fn client_config_with_identity() {
        let (cert, key) = self_signed();
        let tls = ClientTls::new(cert.clone())
            .expect("ca")
            .with_identity(cert, key)
            .expect("identity")
            .with_domain("main.iam.local");
        assert!(tls.identity.is_some());
        assert_eq!(tls.domain.as_deref(), Some("main.iam.local"));
        let _ = tls.to_tonic_config();
    }
}
