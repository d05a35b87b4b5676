//! Git push webhooks.
//!
//! Requests are authenticated with `X-Hub-Signature-256: sha256=<hex>`, an
//! HMAC-SHA256 of the raw body keyed by the application's webhook secret.
//! Only a push to the application's configured repository and branch, with
//! auto-deploy on, starts a deployment. Every other verified event is
//! acknowledged and ignored.

use std::sync::Arc;

use fleet_events::BuildTrigger;
use fleet_id::AppId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{aad, CryptoError, SecretBox};
use crate::scheduler::{FleetScheduler, ScheduledDeployment, SchedulerError};
use crate::store::{Store, StoreError};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("application not found: {0}")]
    AppNotFound(AppId),

    /// The application has no Git source or no webhook secret.
    #[error("webhooks are not configured for application {0}")]
    NotConfigured(AppId),

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("missing event header")]
    MissingEvent,

    #[error("invalid push payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a verified webhook led to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Pong,
    Ignored { reason: &'static str },
    Deployed(ScheduledDeployment),
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    deleted: bool,
    repository: PushRepository,
    #[serde(default)]
    head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    id: String,
}

impl PushEvent {
    fn commit(&self) -> Option<String> {
        self.after
            .clone()
            .filter(|sha| !sha.is_empty() && !sha.bytes().all(|b| b == b'0'))
            .or_else(|| self.head_commit.as_ref().map(|c| c.id.clone()))
    }
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn signature_header(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a `sha256=<hex>` header against `body` in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> Result<(), WebhookError> {
    let digest = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(WebhookError::SignatureMismatch)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| WebhookError::SignatureMismatch)
}

pub struct WebhookIngest {
    store: Arc<dyn Store>,
    scheduler: Arc<FleetScheduler>,
    secrets: SecretBox,
}

impl WebhookIngest {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<FleetScheduler>, secrets: SecretBox) -> Self {
        Self {
            store,
            scheduler,
            secrets,
        }
    }

    /// Verify and act on one delivery.
    pub async fn handle(
        &self,
        app_id: AppId,
        event: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookError> {
        let app = self
            .store
            .get_application(app_id)
            .await?
            .ok_or(WebhookError::AppNotFound(app_id))?;
        let git = app.git.ok_or(WebhookError::NotConfigured(app_id))?;
        let sealed = git
            .sealed_webhook_secret
            .as_deref()
            .ok_or(WebhookError::NotConfigured(app_id))?;

        let secret = self.secrets.open(sealed, &aad::webhook_secret(app_id))?;
        let Some(signature) = signature else {
            warn!(app_id = %app_id, "webhook without signature");
            return Err(WebhookError::SignatureMismatch);
        };
        if let Err(e) = verify_signature(secret.as_bytes(), body, signature) {
            warn!(app_id = %app_id, "webhook signature mismatch");
            return Err(e);
        }

        match event.ok_or(WebhookError::MissingEvent)? {
            "ping" => return Ok(WebhookOutcome::Pong),
            "push" => {}
            other => {
                debug!(app_id = %app_id, event = other, "ignoring webhook event");
                return Ok(WebhookOutcome::Ignored {
                    reason: "unsupported event",
                });
            }
        }

        let push: PushEvent = serde_json::from_slice(body)?;

        if !push.repository.full_name.eq_ignore_ascii_case(&git.repository) {
            return Ok(WebhookOutcome::Ignored {
                reason: "repository mismatch",
            });
        }
        if push.git_ref != format!("refs/heads/{}", git.branch) {
            return Ok(WebhookOutcome::Ignored {
                reason: "branch mismatch",
            });
        }
        if push.deleted {
            return Ok(WebhookOutcome::Ignored {
                reason: "branch deleted",
            });
        }
        if !git.auto_deploy {
            return Ok(WebhookOutcome::Ignored {
                reason: "auto deploy disabled",
            });
        }

        let commit = push.commit();
        let scheduled = self
            .scheduler
            .schedule_deployment(app_id, commit.clone(), BuildTrigger::Webhook)
            .await?;
        info!(
            app_id = %app_id,
            build_id = %scheduled.build_id,
            commit = commit.as_deref().unwrap_or("-"),
            "push deployment scheduled"
        );
        Ok(WebhookOutcome::Deployed(scheduled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let header = signature_header(b"s3cret", b"{\"zen\":\"hi\"}").unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(b"s3cret", b"{\"zen\":\"hi\"}", &header).is_ok());
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2.
        let header = signature_header(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            header,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_rejects_tampered_body_and_bad_headers() {
        let header = signature_header(b"s3cret", b"body").unwrap();
        assert!(matches!(
            verify_signature(b"s3cret", b"bodx", &header),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(verify_signature(b"other", b"body", &header).is_err());
        assert!(verify_signature(b"s3cret", b"body", header.trim_start_matches("sha256=")).is_err());
        assert!(verify_signature(b"s3cret", b"body", "sha256=zz").is_err());
    }

    #[test]
    fn test_commit_falls_back_to_head_commit() {
        let push: PushEvent = serde_json::from_str(
            r#"{"ref":"refs/heads/main","repository":{"full_name":"o/r"},"head_commit":{"id":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(push.commit().as_deref(), Some("abc"));

        let push: PushEvent = serde_json::from_str(
            r#"{"ref":"refs/heads/main","after":"def","repository":{"full_name":"o/r"}}"#,
        )
        .unwrap();
        assert_eq!(push.commit().as_deref(), Some("def"));
    }
}
