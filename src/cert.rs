//! File-backed certificate storage
//!
//! Each certificate type owns a directory under the cert storage root:
//!
//! ```text
//! <storage>/<cert type>/pending.key.pem      key awaiting its certificate
//! <storage>/<cert type>/<SERIAL>.cert.pem    issued certificate
//! <storage>/<cert type>/<SERIAL>.key.pem     its private key
//! ```
//!
//! [`FileCertHandler`] generates keys and CSRs and installs signed
//! certificates. [`FileCertProvider`] indexes the installed certificates and
//! notifies subscribers when a new one is installed.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use iam_proto::CertInfo;
use iam_server::{CertProvider, CertReceiver, ServiceError};
use parking_lot::{Mutex, RwLock};
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, KeyPair, SanType,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::config::CertModuleConfig;

const PENDING_KEY_FILE: &str = "pending.key.pem";
const CERT_SUFFIX: &str = ".cert.pem";
const KEY_SUFFIX: &str = ".key.pem";

/// An installed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    /// Certificate type
    pub cert_type: String,
    /// DER encoded issuer name
    pub issuer: Vec<u8>,
    /// Raw serial number bytes
    pub serial: Vec<u8>,
    /// Location of the certificate PEM
    pub cert_url: String,
    /// Location of the private key PEM
    pub key_url: String,
    /// Expiry as a Unix timestamp
    pub not_after: i64,
}

impl CertRecord {
    /// Serial number as uppercase hex
    pub fn serial_hex(&self) -> String {
        hex::encode_upper(&self.serial)
    }

    /// Wire form returned by the certificate lookup RPCs
    pub fn to_cert_info(&self) -> CertInfo {
        CertInfo {
            cert_type: self.cert_type.clone(),
            key_url: self.key_url.clone(),
            cert_url: self.cert_url.clone(),
        }
    }
}

/// Key generation and certificate installation for one node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertHandler: Send + Sync {
    /// Generate a key for `cert_type` and return a CSR in PEM form
    async fn create_key(
        &self,
        cert_type: &str,
        subject: &str,
        password: &str,
    ) -> Result<String, ServiceError>;

    /// Install a certificate signed for the pending key of `cert_type`
    async fn apply_cert(&self, cert_type: &str, pem_cert: &str)
        -> Result<CertRecord, ServiceError>;
}

/// Path of a `file://` URL
pub fn url_to_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn io_failed(what: &str, path: &Path, e: std::io::Error) -> ServiceError {
    ServiceError::failed(format!("{} {}: {}", what, path.display(), e))
}

/// Parse a PEM certificate into a record stored at `cert_path`
fn parse_cert(cert_type: &str, pem_cert: &str, cert_path: &Path) -> Result<(CertRecord, Vec<u8>), ServiceError> {
    let block = ::pem::parse(pem_cert.as_bytes())
        .map_err(|e| ServiceError::InvalidArgument(format!("bad certificate PEM: {}", e)))?;

    if block.tag() != "CERTIFICATE" {
        return Err(ServiceError::InvalidArgument(format!(
            "unexpected PEM block {}",
            block.tag()
        )));
    }

    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| ServiceError::InvalidArgument(format!("bad certificate: {}", e)))?;

    let serial = cert.raw_serial().to_vec();
    let serial_hex = hex::encode_upper(&serial);
    let dir = cert_path.parent().unwrap_or_else(|| Path::new("."));

    let record = CertRecord {
        cert_type: cert_type.to_string(),
        issuer: cert.issuer().as_raw().to_vec(),
        serial,
        cert_url: file_url(cert_path),
        key_url: file_url(&dir.join(format!("{}{}", serial_hex, KEY_SUFFIX))),
        not_after: cert.validity().not_after.timestamp(),
    };

    Ok((record, cert.public_key().subject_public_key.data.to_vec()))
}

/// Index of installed certificates with change subscriptions
#[derive(Default)]
pub struct FileCertProvider {
    certs: RwLock<HashMap<String, Vec<CertRecord>>>,
    subscriptions: DashMap<Uuid, (String, Arc<dyn CertReceiver>)>,
}

impl FileCertProvider {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the certificates already installed under `storage`
    ///
    /// Unreadable or malformed files are skipped with a warning.
    pub fn load(storage: &Path, modules: &[CertModuleConfig]) -> Self {
        let provider = Self::new();

        for module in modules {
            let dir = storage.join(&module.id);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Can't read cert directory");
                    continue;
                }
            };

            let mut records = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.to_string_lossy().ends_with(CERT_SUFFIX) {
                    continue;
                }

                let parsed = std::fs::read_to_string(&path)
                    .map_err(|e| io_failed("read", &path, e))
                    .and_then(|pem| parse_cert(&module.id, &pem, &path));

                match parsed {
                    Ok((record, _)) => records.push(record),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping certificate"),
                }
            }

            records.sort_by_key(|r| r.not_after);
            debug!(cert_type = %module.id, count = records.len(), "Certificates loaded");
            provider.certs.write().insert(module.id.clone(), records);
        }

        provider
    }

    /// Record a new certificate and notify its subscribers
    ///
    /// Keeps at most `max_items` certificates of the type and returns the
    /// ones that were evicted, oldest first.
    pub fn add_cert(&self, record: CertRecord, max_items: usize) -> Vec<CertRecord> {
        let evicted = {
            let mut certs = self.certs.write();
            let list = certs.entry(record.cert_type.clone()).or_default();
            list.retain(|r| r.serial != record.serial);
            list.push(record.clone());

            let excess = list.len().saturating_sub(max_items.max(1));
            list.drain(..excess).collect::<Vec<_>>()
        };

        let info = record.to_cert_info();
        let receivers: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().0 == record.cert_type)
            .map(|entry| Arc::clone(&entry.value().1))
            .collect();

        for receiver in receivers {
            receiver.on_cert_changed(&info);
        }

        evicted
    }
}

#[async_trait]
impl CertProvider for FileCertProvider {
    async fn get_cert(
        &self,
        cert_type: &str,
        issuer: &[u8],
        serial: &[u8],
    ) -> Result<CertInfo, ServiceError> {
        let certs = self.certs.read();
        let list = certs
            .get(cert_type)
            .ok_or_else(|| ServiceError::NotFound(format!("cert type {}", cert_type)))?;

        let found = if serial.is_empty() {
            list.last()
        } else {
            list.iter()
                .rev()
                .find(|r| r.serial == serial && (issuer.is_empty() || r.issuer == issuer))
        };

        found
            .map(CertRecord::to_cert_info)
            .ok_or_else(|| ServiceError::NotFound(format!("certificate of type {}", cert_type)))
    }

    fn subscribe_cert_changed(
        &self,
        cert_type: &str,
        receiver: Arc<dyn CertReceiver>,
    ) -> Result<Uuid, ServiceError> {
        let id = Uuid::new_v4();
        self.subscriptions
            .insert(id, (cert_type.to_string(), receiver));
        Ok(id)
    }

    fn unsubscribe_cert_changed(&self, subscription: Uuid) -> Result<(), ServiceError> {
        self.subscriptions
            .remove(&subscription)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {}", subscription)))
    }
}

/// [`CertHandler`] keeping keys and certificates in the cert storage directory
pub struct FileCertHandler {
    storage: PathBuf,
    modules: HashMap<String, CertModuleConfig>,
    provider: Arc<FileCertProvider>,
    lock: Mutex<()>,
}

impl FileCertHandler {
    /// Create a handler for the configured cert modules
    pub fn new(storage: PathBuf, modules: &[CertModuleConfig], provider: Arc<FileCertProvider>) -> Self {
        Self {
            storage,
            modules: modules
                .iter()
                .map(|m| (m.id.clone(), m.clone()))
                .collect(),
            provider,
            lock: Mutex::new(()),
        }
    }

    fn module(&self, cert_type: &str) -> Result<&CertModuleConfig, ServiceError> {
        self.modules
            .get(cert_type)
            .filter(|m| !m.disabled)
            .ok_or_else(|| ServiceError::NotFound(format!("cert type {}", cert_type)))
    }

    fn type_dir(&self, cert_type: &str) -> PathBuf {
        self.storage.join(cert_type)
    }
}

fn generate_key(algorithm: &str) -> Result<KeyPair, ServiceError> {
    match algorithm.to_ascii_lowercase().as_str() {
        "ecc" | "ecdsa" | "" => KeyPair::generate()
            .map_err(|e| ServiceError::failed(format!("key generation failed: {}", e))),
        other => Err(ServiceError::InvalidArgument(format!(
            "unsupported key algorithm {}",
            other
        ))),
    }
}

fn csr_params(subject: &str, module: &CertModuleConfig) -> Result<CertificateParams, ServiceError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(subject.to_string()));
    params.distinguished_name = dn;

    params.subject_alt_names = module
        .alternative_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| {
                    ServiceError::InvalidArgument(format!("invalid alternative name {}: {}", name, e))
                })
        })
        .collect::<Result<_, _>>()?;

    params.extended_key_usages = module
        .extended_key_usage
        .iter()
        .filter_map(|usage| match usage.as_str() {
            "clientAuth" => Some(ExtendedKeyUsagePurpose::ClientAuth),
            "serverAuth" => Some(ExtendedKeyUsagePurpose::ServerAuth),
            other => {
                warn!(usage = %other, "Ignoring unknown extended key usage");
                None
            }
        })
        .collect();

    Ok(params)
}

#[async_trait]
impl CertHandler for FileCertHandler {
    async fn create_key(
        &self,
        cert_type: &str,
        subject: &str,
        _password: &str,
    ) -> Result<String, ServiceError> {
        let module = self.module(cert_type)?;

        if subject.is_empty() {
            return Err(ServiceError::InvalidArgument("subject can't be empty".to_string()));
        }

        let key = generate_key(&module.algorithm)?;
        let csr = csr_params(subject, module)?
            .serialize_request(&key)
            .and_then(|csr| csr.pem())
            .map_err(|e| ServiceError::failed(format!("failed to create CSR: {}", e)))?;

        let key_pem = Zeroizing::new(key.serialize_pem());
        let dir = self.type_dir(cert_type);
        let key_path = dir.join(PENDING_KEY_FILE);

        let _guard = self.lock.lock();
        std::fs::create_dir_all(&dir).map_err(|e| io_failed("create", &dir, e))?;
        std::fs::write(&key_path, key_pem.as_bytes()).map_err(|e| io_failed("write", &key_path, e))?;

        info!(cert_type = %cert_type, subject = %subject, "Key created");

        Ok(csr)
    }

    async fn apply_cert(&self, cert_type: &str, pem_cert: &str) -> Result<CertRecord, ServiceError> {
        let max_items = self.module(cert_type)?.max_items;
        let dir = self.type_dir(cert_type);
        let pending_path = dir.join(PENDING_KEY_FILE);

        let _guard = self.lock.lock();

        let pending = Zeroizing::new(std::fs::read_to_string(&pending_path).map_err(|e| {
            match e.kind() {
                ErrorKind::NotFound => {
                    ServiceError::WrongState(format!("no pending key for {}", cert_type))
                }
                _ => io_failed("read", &pending_path, e),
            }
        })?);
        let key = KeyPair::from_pem(&pending)
            .map_err(|e| ServiceError::failed(format!("bad pending key: {}", e)))?;

        // the file name depends on the serial, parse against a placeholder first
        let (parsed, public_key) = parse_cert(cert_type, pem_cert, &dir.join(CERT_SUFFIX))?;
        if public_key != key.public_key_raw() {
            return Err(ServiceError::InvalidArgument(
                "certificate doesn't match the pending key".to_string(),
            ));
        }

        let serial_hex = parsed.serial_hex();
        let cert_path = dir.join(format!("{}{}", serial_hex, CERT_SUFFIX));
        let key_path = dir.join(format!("{}{}", serial_hex, KEY_SUFFIX));

        std::fs::write(&cert_path, pem_cert).map_err(|e| io_failed("write", &cert_path, e))?;
        std::fs::rename(&pending_path, &key_path).map_err(|e| io_failed("rename", &pending_path, e))?;

        let record = CertRecord {
            cert_url: file_url(&cert_path),
            key_url: file_url(&key_path),
            ..parsed
        };

        for old in self.provider.add_cert(record.clone(), max_items) {
            for url in [&old.cert_url, &old.key_url] {
                if let Some(path) = url_to_path(url) {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove old certificate file");
                    }
                }
            }
        }

        info!(cert_type = %cert_type, serial = %serial_hex, "Certificate applied");

        Ok(record)
    }
}
