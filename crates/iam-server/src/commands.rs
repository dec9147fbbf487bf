//! Provisioning lifecycle hooks backed by external commands

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::ServiceError;
use crate::services::ProvisionCallback;

/// Command lines run around provisioning steps
///
/// Each entry is a program followed by its arguments. An empty entry makes
/// the corresponding step a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionCommandArgs {
    /// Run when provisioning starts
    pub start_provisioning: Vec<String>,
    /// Run when provisioning finishes
    pub finish_provisioning: Vec<String>,
    /// Run when the node is deprovisioned
    pub deprovision: Vec<String>,
    /// Run to encrypt the node's disk
    pub disk_encryption: Vec<String>,
}

/// [`ProvisionCallback`] that runs the configured commands
#[derive(Debug, Clone, Default)]
pub struct ProvisionCommands {
    args: ProvisionCommandArgs,
}

impl ProvisionCommands {
    /// Create hooks running `args`
    pub fn new(args: ProvisionCommandArgs) -> Self {
        Self { args }
    }
}

async fn exec_command(name: &str, args: &[String]) -> Result<(), ServiceError> {
    let Some((program, rest)) = args.split_first() else {
        return Ok(());
    };

    debug!(command = name, program = %program, "Running provisioning command");

    let output = Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(|e| {
            error!(command = name, program = %program, error = %e, "Failed to launch command");
            ServiceError::failed(format!("{} launch failed: {}", name, e))
        })?;

    if output.status.success() {
        return Ok(());
    }

    let exit_code = output.status.code().unwrap_or(-1);
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    error!(
        command = name,
        program = %program,
        exit_code = exit_code,
        output = %combined.trim_end(),
        "Command failed"
    );

    Err(ServiceError::Failed {
        message: format!("process failed: cmd={}, code={}", program, exit_code),
        exit_code,
    })
}

#[async_trait]
impl ProvisionCallback for ProvisionCommands {
    async fn on_start_provisioning(&self, _password: &str) -> Result<(), ServiceError> {
        exec_command("start provisioning", &self.args.start_provisioning).await
    }

    async fn on_finish_provisioning(&self, _password: &str) -> Result<(), ServiceError> {
        exec_command("finish provisioning", &self.args.finish_provisioning).await
    }

    async fn on_deprovision(&self, _password: &str) -> Result<(), ServiceError> {
        exec_command("deprovision", &self.args.deprovision).await
    }

    async fn on_encrypt_disk(&self, _password: &str) -> Result<(), ServiceError> {
        exec_command("encrypt disk", &self.args.disk_encryption).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_command_is_noop() {
        let hooks = ProvisionCommands::default();
        hooks.on_start_provisioning("pwd").await.expect("noop");
        hooks.on_encrypt_disk("pwd").await.expect("noop");
    }

    #[tokio::test]
    async fn successful_command_passes() {
        let hooks = ProvisionCommands::new(ProvisionCommandArgs {
            finish_provisioning: cmd(&["sh", "-c", "exit 0"]),
            ..Default::default()
        });
        hooks.on_finish_provisioning("pwd").await.expect("exit 0");
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let hooks = ProvisionCommands::new(ProvisionCommandArgs {
            deprovision: cmd(&["sh", "-c", "echo boom; exit 3"]),
            ..Default::default()
        });

        let err = hooks.on_deprovision("pwd").await.expect_err("exit 3");
        match err {
            ServiceError::Failed { exit_code, message } => {
                assert_eq!(exit_code, 3);
                assert!(message.contains("code=3"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let hooks = ProvisionCommands::new(ProvisionCommandArgs {
            disk_encryption: cmd(&["/nonexistent/encrypt-disk"]),
            ..Default::default()
        });
        assert!(hooks.on_encrypt_disk("pwd").await.is_err());
    }
}
