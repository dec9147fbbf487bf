//! JSON configuration for the IAM node agent
//!
//! Keys are PascalCase. Durations use humantime strings such as `"10s"` or
//! `"5m"`. Listener addresses starting with `:` listen on every interface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use iam_server::handler::{DEFAULT_PROVISIONING_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use iam_server::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL};
use iam_server::{correct_address, HandlerConfig, ProvisionCommandArgs, RequestTimeouts, RetryConfig};
use serde::Deserialize;
use thiserror::Error;

/// Identifier plugin reading identity from local files
pub const FILE_IDENTIFIER_PLUGIN: &str = "fileidentifier";

/// Default wait between secondary node reconnect attempts
pub const DEFAULT_NODE_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config file path
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Config file is not valid JSON or misses required keys
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A listener address is empty or malformed
    #[error("invalid {field}: {reason}")]
    InvalidAddress {
        /// Config key
        field: &'static str,
        /// Why the address was rejected
        reason: String,
    },

    /// Identifier plugin is not supported
    #[error("unsupported identifier plugin: {0}")]
    UnsupportedIdentifier(String),

    /// A value is inconsistent with the rest of the config
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Partition reported in this node's info
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PartitionConfig {
    /// Partition name
    pub name: String,
    /// Partition types (e.g. "services", "layers")
    #[serde(default)]
    pub types: Vec<String>,
    /// Mount path
    #[serde(default)]
    pub path: String,
}

/// Sources and static values for this node's info
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfoConfig {
    /// cpuinfo file
    #[serde(rename = "CPUInfoPath", default = "default_cpu_info_path")]
    pub cpu_info_path: PathBuf,
    /// meminfo file
    #[serde(default = "default_mem_info_path")]
    pub mem_info_path: PathBuf,
    /// File holding the provisioning state; absent means unprovisioned
    pub provisioning_state_path: PathBuf,
    /// File whose first line is the node ID
    #[serde(rename = "NodeIDPath")]
    pub node_id_path: PathBuf,
    /// Human readable node name
    #[serde(default)]
    pub node_name: String,
    /// Node type
    #[serde(default)]
    pub node_type: String,
    /// Operating system type
    #[serde(rename = "OSType", default)]
    pub os_type: String,
    /// Node performance in DMIPS
    #[serde(rename = "MaxDMIPS", default)]
    pub max_dmips: u64,
    /// Node attributes, `MainNode` marks the main node
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Partitions
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

fn default_cpu_info_path() -> PathBuf {
    PathBuf::from("/proc/cpuinfo")
}

fn default_mem_info_path() -> PathBuf {
    PathBuf::from("/proc/meminfo")
}

/// Certificate type this node can create keys for
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CertModuleConfig {
    /// Certificate type, e.g. "iam", "online", "offline"
    #[serde(rename = "ID")]
    pub id: String,
    /// Storage plugin name
    #[serde(default)]
    pub plugin: String,
    /// Key algorithm, "ecc" or "rsa"
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Number of certificates kept per type
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Extended key usages requested in the CSR ("clientAuth", "serverAuth")
    #[serde(default)]
    pub extended_key_usage: Vec<String>,
    /// DNS names requested in the CSR
    #[serde(default)]
    pub alternative_names: Vec<String>,
    /// Excluded from the reported cert types
    #[serde(default)]
    pub disabled: bool,
}

fn default_algorithm() -> String {
    "ecc".to_string()
}

fn default_max_items() -> usize {
    1
}

/// File identifier parameters
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FileIdentifierConfig {
    /// File holding the system ID
    #[serde(rename = "SystemIDPath")]
    pub system_id_path: PathBuf,
    /// File holding the unit model
    pub unit_model_path: PathBuf,
    /// File listing subjects one per line
    #[serde(default)]
    pub subjects_path: Option<PathBuf>,
}

/// Identifier plugin selection
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct IdentifierConfig {
    /// Plugin name, empty disables the identity service
    #[serde(default)]
    pub plugin: String,
    /// Plugin parameters
    #[serde(default)]
    pub params: Option<FileIdentifierConfig>,
}

/// Retry policy for forwarded requests
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RetrySettings {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait between attempts
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Forwarded request timeouts
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TimeoutSettings {
    /// Status and certificate requests
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub default: Duration,
    /// Provisioning requests
    #[serde(with = "humantime_serde", default = "default_provisioning_timeout")]
    pub provisioning: Duration,
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_provisioning_timeout() -> Duration {
    DEFAULT_PROVISIONING_TIMEOUT
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default: DEFAULT_REQUEST_TIMEOUT,
            provisioning: DEFAULT_PROVISIONING_TIMEOUT,
        }
    }
}

fn default_reconnect_interval() -> Duration {
    DEFAULT_NODE_RECONNECT_INTERVAL
}

/// Node agent configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// This node's info sources
    pub node_info: NodeInfoConfig,
    /// Public listener address
    #[serde(rename = "IAMPublicServerURL")]
    pub iam_public_server_url: String,
    /// Protected listener address
    #[serde(rename = "IAMProtectedServerURL")]
    pub iam_protected_server_url: String,
    /// Main node public URL, used by secondary nodes
    #[serde(rename = "MainIAMPublicServerURL", default)]
    pub main_iam_public_server_url: String,
    /// Main node protected URL, used by secondary nodes
    #[serde(rename = "MainIAMProtectedServerURL", default)]
    pub main_iam_protected_server_url: String,
    /// Wait between secondary node reconnect attempts
    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub node_reconnect_interval: Duration,
    /// CA certificate verifying clients and the main node
    #[serde(rename = "CACert", default)]
    pub ca_cert: Option<PathBuf>,
    /// Directory holding issued keys and certificates
    pub cert_storage: PathBuf,
    /// Certificate types this node manages
    #[serde(default)]
    pub cert_modules: Vec<CertModuleConfig>,
    /// Command run when provisioning starts
    #[serde(default)]
    pub start_provisioning_cmd_args: Vec<String>,
    /// Command run when provisioning finishes
    #[serde(default)]
    pub finish_provisioning_cmd_args: Vec<String>,
    /// Command run on deprovisioning
    #[serde(default)]
    pub deprovision_cmd_args: Vec<String>,
    /// Command encrypting the disk during provisioning
    #[serde(default)]
    pub disk_encryption_cmd_args: Vec<String>,
    /// Serve the permission services
    #[serde(default)]
    pub enable_permissions_handler: bool,
    /// Identity source
    #[serde(default)]
    pub identifier: IdentifierConfig,
    /// Forwarded request retry policy
    #[serde(default)]
    pub retry: RetrySettings,
    /// Forwarded request timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl Config {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::parse(&text)
    }

    /// Parse and validate config text
    ///
    /// Listener addresses are normalized in place.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.iam_public_server_url = normalize("IAMPublicServerURL", &self.iam_public_server_url)?;
        self.iam_protected_server_url =
            normalize("IAMProtectedServerURL", &self.iam_protected_server_url)?;

        match self.identifier.plugin.as_str() {
            "" => {}
            FILE_IDENTIFIER_PLUGIN => {
                if self.identifier.params.is_none() {
                    return Err(ConfigError::Invalid(
                        "fileidentifier requires Params".to_string(),
                    ));
                }
            }
            other => return Err(ConfigError::UnsupportedIdentifier(other.to_string())),
        }

        let mut seen = std::collections::HashSet::new();
        for module in &self.cert_modules {
            if module.id.is_empty() {
                return Err(ConfigError::Invalid("cert module without ID".to_string()));
            }
            if !seen.insert(module.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cert module {}",
                    module.id
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "Retry.MaxAttempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether this node hosts the node registry
    pub fn is_main_node(&self) -> bool {
        self.node_info
            .attrs
            .keys()
            .any(|name| name.eq_ignore_ascii_case(iam_proto::MAIN_NODE_ATTRIBUTE))
    }

    /// Message handler tunables
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            retry: RetryConfig::new(self.retry.max_attempts, self.retry.retry_interval),
            timeouts: RequestTimeouts {
                default: self.timeouts.default,
                provisioning: self.timeouts.provisioning,
            },
            ..Default::default()
        }
    }

    /// Provisioning hook commands
    pub fn provision_command_args(&self) -> ProvisionCommandArgs {
        ProvisionCommandArgs {
            start_provisioning: self.start_provisioning_cmd_args.clone(),
            finish_provisioning: self.finish_provisioning_cmd_args.clone(),
            deprovision: self.deprovision_cmd_args.clone(),
            disk_encryption: self.disk_encryption_cmd_args.clone(),
        }
    }
}

fn normalize(field: &'static str, addr: &str) -> Result<String, ConfigError> {
    correct_address(addr).map_err(|e| ConfigError::InvalidAddress {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "NodeInfo": {
            "ProvisioningStatePath": "/var/aos/.provisionstate",
            "NodeIDPath": "/etc/machine-id",
            "Attrs": {"MainNode": ""}
        },
        "IAMPublicServerURL": ":8090",
        "IAMProtectedServerURL": "localhost:8089",
        "CertStorage": "/var/aos/crypt/iam"
    }"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::parse(MINIMAL).expect("valid config");

        assert_eq!(config.iam_public_server_url, "0.0.0.0:8090");
        assert_eq!(config.iam_protected_server_url, "localhost:8089");
        assert_eq!(config.node_reconnect_interval, DEFAULT_NODE_RECONNECT_INTERVAL);
        assert_eq!(config.node_info.cpu_info_path, PathBuf::from("/proc/cpuinfo"));
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.timeouts, TimeoutSettings::default());
        assert!(config.is_main_node());
        assert!(!config.enable_permissions_handler);
    }

    #[test]
    fn full_config_is_parsed() {
        let text = r#"{
            "NodeInfo": {
                "CPUInfoPath": "/tmp/cpuinfo",
                "MemInfoPath": "/tmp/meminfo",
                "ProvisioningStatePath": "/tmp/state",
                "NodeIDPath": "/tmp/node-id",
                "NodeName": "node1",
                "NodeType": "secondary",
                "OSType": "linux",
                "MaxDMIPS": 10000,
                "Attrs": {"attr1": "value1"},
                "Partitions": [{"Name": "var", "Types": ["services"], "Path": "/var"}]
            },
            "IAMPublicServerURL": "node1:8090",
            "IAMProtectedServerURL": "node1:8089",
            "MainIAMPublicServerURL": "http://main:8090",
            "MainIAMProtectedServerURL": "https://main:8089",
            "NodeReconnectInterval": "30s",
            "CACert": "/etc/ssl/ca.pem",
            "CertStorage": "/var/aos/crypt",
            "CertModules": [
                {"ID": "iam", "Plugin": "filestorage", "Algorithm": "ecc", "MaxItems": 2,
                 "ExtendedKeyUsage": ["clientAuth", "serverAuth"], "AlternativeNames": ["node1"]},
                {"ID": "offline", "Disabled": true}
            ],
            "StartProvisioningCmdArgs": ["/bin/start"],
            "FinishProvisioningCmdArgs": ["/bin/finish", "--now"],
            "DeprovisionCmdArgs": ["/bin/deprovision"],
            "DiskEncryptionCmdArgs": ["/bin/encrypt"],
            "EnablePermissionsHandler": true,
            "Identifier": {
                "Plugin": "fileidentifier",
                "Params": {"SystemIDPath": "/tmp/sid", "UnitModelPath": "/tmp/model"}
            },
            "Retry": {"MaxAttempts": 5, "RetryInterval": "2s"},
            "Timeouts": {"Default": "30s", "Provisioning": "10m"}
        }"#;

        let config = Config::parse(text).expect("valid config");

        assert!(!config.is_main_node());
        assert_eq!(config.node_info.max_dmips, 10000);
        assert_eq!(config.node_info.partitions[0].types, vec!["services"]);
        assert_eq!(config.node_reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.cert_modules.len(), 2);
        assert!(config.cert_modules[1].disabled);
        assert_eq!(config.cert_modules[1].algorithm, "ecc");

        let handler = config.handler_config();
        assert_eq!(handler.retry.max_attempts, 5);
        assert_eq!(handler.retry.retry_interval, Duration::from_secs(2));
        assert_eq!(handler.timeouts.provisioning, Duration::from_secs(600));

        let commands = config.provision_command_args();
        assert_eq!(commands.finish_provisioning, vec!["/bin/finish", "--now"]);
        assert_eq!(commands.disk_encryption, vec!["/bin/encrypt"]);

        let params = config.identifier.params.expect("params");
        assert!(params.subjects_path.is_none());
    }

    #[test]
    fn empty_address_is_rejected() {
        let text = MINIMAL.replace("\":8090\"", "\"\"");
        let err = Config::parse(&text).expect_err("empty address");
        assert!(matches!(
            err,
            ConfigError::InvalidAddress {
                field: "IAMPublicServerURL",
                ..
            }
        ));
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let text = MINIMAL.replace(
            "\"CertStorage\"",
            "\"Identifier\": {\"Plugin\": \"visidentifier\"}, \"CertStorage\"",
        );
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::UnsupportedIdentifier(_))
        ));
    }

    #[test]
    fn duplicate_cert_module_is_rejected() {
        let text = MINIMAL.replace(
            "\"CertStorage\"",
            "\"CertModules\": [{\"ID\": \"iam\"}, {\"ID\": \"iam\"}], \"CertStorage\"",
        );
        assert!(matches!(Config::parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_required_key_is_parse_error() {
        assert!(matches!(
            Config::parse(r#"{"IAMPublicServerURL": ":1"}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/aos_iamanager.cfg")),
            Err(ConfigError::Read { .. })
        ));
    }
}
