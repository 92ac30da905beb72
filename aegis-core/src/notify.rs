//! Account event notifications
//!
//! Notification delivery is best effort: ceremonies log a failed
//! notification and carry on.

use async_trait::async_trait;

use crate::credential::WebAuthnCredential;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Sink for security-relevant account events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A second factor was added to `username`'s account.
    async fn second_factor_added(
        &self,
        username: &str,
        credential: &WebAuthnCredential,
    ) -> Result<(), NotifyError>;
}

/// Emits notifications as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn second_factor_added(
        &self,
        username: &str,
        credential: &WebAuthnCredential,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            username = %username,
            rp_id = %credential.rp_id,
            description = %credential.description,
            "Second factor added: WebAuthn credential"
        );
        Ok(())
    }
}
