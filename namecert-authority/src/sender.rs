//! Email delivery collaborators for the email challenge.

use async_trait::async_trait;

use namecert_core::challenge::email::{EmailSendError, EmailSender};
use namecert_core::Name;

/// Logs the PIN instead of delivering it. Development only.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_code(
        &self,
        email: &str,
        code: &str,
        ca_prefix: &Name,
        cert_name: &Name,
    ) -> Result<(), EmailSendError> {
        tracing::info!(email, code, ca = %ca_prefix, cert = %cert_name, "email PIN (log sender)");
        Ok(())
    }
}

/// Hands the PIN to an external command:
/// `<command> <email> <code> <ca-prefix> <cert-name>`.
pub struct CommandEmailSender {
    command: String,
}

impl CommandEmailSender {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl EmailSender for CommandEmailSender {
    async fn send_code(
        &self,
        email: &str,
        code: &str,
        ca_prefix: &Name,
        cert_name: &Name,
    ) -> Result<(), EmailSendError> {
        let status = tokio::process::Command::new(&self.command)
            .arg(email)
            .arg(code)
            .arg(ca_prefix.to_string())
            .arg(cert_name.to_string())
            .status()
            .await
            .map_err(|error| EmailSendError(error.to_string()))?;
        if !status.success() {
            return Err(EmailSendError(format!(
                "{} exited with {status}",
                self.command
            )));
        }
        Ok(())
    }
}
