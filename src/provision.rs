//! Provisioning driven by configuration

use std::sync::Arc;

use async_trait::async_trait;
use iam_server::{AppliedCert, ProvisionCallback, ProvisionManager, ServiceError};
use tracing::{debug, info};

use crate::cert::CertHandler;
use crate::config::CertModuleConfig;

/// [`ProvisionManager`] over the configured cert modules
///
/// Lifecycle steps run the [`ProvisionCallback`] hooks. Starting
/// provisioning also encrypts the disk. Key and certificate requests go to
/// the [`CertHandler`].
pub struct ConfigProvisionManager {
    modules: Vec<CertModuleConfig>,
    callback: Arc<dyn ProvisionCallback>,
    cert_handler: Arc<dyn CertHandler>,
}

impl ConfigProvisionManager {
    /// Create a manager
    pub fn new(
        modules: Vec<CertModuleConfig>,
        callback: Arc<dyn ProvisionCallback>,
        cert_handler: Arc<dyn CertHandler>,
    ) -> Self {
        Self {
            modules,
            callback,
            cert_handler,
        }
    }
}

#[async_trait]
impl ProvisionManager for ConfigProvisionManager {
    async fn get_cert_types(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self
            .modules
            .iter()
            .filter(|m| !m.disabled)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn start_provisioning(&self, password: &str) -> Result<(), ServiceError> {
        info!("Start provisioning");

        self.callback.on_start_provisioning(password).await?;
        self.callback.on_encrypt_disk(password).await
    }

    async fn finish_provisioning(&self, password: &str) -> Result<(), ServiceError> {
        info!("Finish provisioning");

        self.callback.on_finish_provisioning(password).await
    }

    async fn deprovision(&self, password: &str) -> Result<(), ServiceError> {
        info!("Deprovision");

        self.callback.on_deprovision(password).await
    }

    async fn create_key(
        &self,
        cert_type: &str,
        subject: &str,
        password: &str,
    ) -> Result<String, ServiceError> {
        debug!(cert_type = %cert_type, subject = %subject, "Create key");

        self.cert_handler.create_key(cert_type, subject, password).await
    }

    async fn apply_cert(
        &self,
        cert_type: &str,
        pem_cert: &str,
    ) -> Result<AppliedCert, ServiceError> {
        debug!(cert_type = %cert_type, "Apply cert");

        let record = self.cert_handler.apply_cert(cert_type, pem_cert).await?;

        Ok(AppliedCert {
            serial: record.serial_hex(),
            cert_url: record.cert_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CertRecord, MockCertHandler};
    use iam_server::{ProvisionCommandArgs, ProvisionCommands};

    fn modules() -> Vec<CertModuleConfig> {
        vec![
            CertModuleConfig {
                id: "iam".to_string(),
                ..Default::default()
            },
            CertModuleConfig {
                id: "offline".to_string(),
                disabled: true,
                ..Default::default()
            },
            CertModuleConfig {
                id: "online".to_string(),
                ..Default::default()
            },
        ]
    }

    fn manager(args: ProvisionCommandArgs, certs: MockCertHandler) -> ConfigProvisionManager {
        ConfigProvisionManager::new(
            modules(),
            Arc::new(ProvisionCommands::new(args)),
            Arc::new(certs),
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn cert_types_skip_disabled_modules() {
        let manager = manager(ProvisionCommandArgs::default(), MockCertHandler::new());
        assert_eq!(
            manager.get_cert_types().await.expect("types"),
            vec!["iam", "online"]
        );
    }

    #[tokio::test]
    async fn start_provisioning_encrypts_disk() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let marker = dir.path().join("encrypted");

        let manager = manager(
            ProvisionCommandArgs {
                start_provisioning: sh("exit 0"),
                disk_encryption: sh(&format!("touch {}", marker.display())),
                ..Default::default()
            },
            MockCertHandler::new(),
        );

        manager.start_provisioning("pwd").await.expect("start");
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn failed_start_skips_disk_encryption() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let marker = dir.path().join("encrypted");

        let manager = manager(
            ProvisionCommandArgs {
                start_provisioning: sh("exit 1"),
                disk_encryption: sh(&format!("touch {}", marker.display())),
                ..Default::default()
            },
            MockCertHandler::new(),
        );

        assert!(manager.start_provisioning("pwd").await.is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn apply_cert_reports_hex_serial() {
        let mut certs = MockCertHandler::new();
        certs
            .expect_apply_cert()
            .withf(|cert_type, _| cert_type == "iam")
            .returning(|cert_type, _| {
                Ok(CertRecord {
                    cert_type: cert_type.to_string(),
                    issuer: vec![],
                    serial: vec![0x01, 0xab],
                    cert_url: "file:///certs/iam/01AB.cert.pem".to_string(),
                    key_url: "file:///certs/iam/01AB.key.pem".to_string(),
                    not_after: 0,
                })
            });

        let manager = manager(ProvisionCommandArgs::default(), certs);
        let applied = manager.apply_cert("iam", "PEM").await.expect("apply");

        assert_eq!(applied.serial, "01AB");
        assert_eq!(applied.cert_url, "file:///certs/iam/01AB.cert.pem");
    }

    #[tokio::test]
    async fn create_key_is_delegated() {
        let mut certs = MockCertHandler::new();
        certs
            .expect_create_key()
            .withf(|cert_type, subject, _| cert_type == "online" && subject == "sys-1")
            .times(1)
            .returning(|_, _, _| Ok("CSR".to_string()));

        let manager = manager(ProvisionCommandArgs::default(), certs);
        assert_eq!(
            manager.create_key("online", "sys-1", "").await.expect("csr"),
            "CSR"
        );
    }
}
