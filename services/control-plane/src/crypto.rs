//! Secret handling for the control plane.
//!
//! - Tokens: registration tokens and per-node secrets are random, URL-safe
//!   strings. Only their SHA-256 hex digest is ever stored.
//! - Sealed values: environment variables, OAuth tokens, database passwords,
//!   and webhook secrets are stored sealed with AES-256-GCM under the
//!   operator's master key. The associated data binds a sealed value to the
//!   record it belongs to, so a value copied onto another record fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const REGISTRATION_TOKEN_PREFIX: &str = "flt_reg_";
pub const NODE_SECRET_PREFIX: &str = "flt_node_";

const TOKEN_BYTES: usize = 32;
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const SEALED_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("missing secrets master key (set FLEET_SECRETS_MASTER_KEY or FLEET_SECRETS_MASTER_KEY_FILE)")]
    MissingMasterKey,
    #[error("invalid secrets master key encoding")]
    InvalidMasterKey,
    #[error("sealing failed")]
    SealFailed,
    #[error("sealed value is malformed")]
    Malformed,
    #[error("opening sealed value failed")]
    OpenFailed,
}

/// Associated-data strings that bind sealed values to their owning record.
pub mod aad {
    use fleet_id::{AppId, DatabaseId};

    pub fn env_var(app_id: AppId, key: &str) -> String {
        format!("{app_id}:env:{key}")
    }

    pub fn git_oauth_token(app_id: AppId) -> String {
        format!("{app_id}:git:oauth_token")
    }

    pub fn webhook_secret(app_id: AppId) -> String {
        format!("{app_id}:git:webhook_secret")
    }

    pub fn database_password(database_id: DatabaseId) -> String {
        format!("{database_id}:password")
    }
}

/// Mint a single-use registration token.
pub fn generate_registration_token() -> String {
    generate_token_with_prefix(REGISTRATION_TOKEN_PREFIX)
}

/// Mint a long-lived per-node secret.
pub fn generate_node_secret() -> String {
    generate_token_with_prefix(NODE_SECRET_PREFIX)
}

fn generate_token_with_prefix(prefix: &str) -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for storage using SHA-256, as lowercase hex.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// AES-256-GCM sealing under the operator master key.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_BYTES],
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

impl SecretBox {
    pub fn new(key: [u8; KEY_BYTES]) -> Self {
        Self { key }
    }

    /// Decode a base64 master key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidMasterKey)?;
        let key: [u8; KEY_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidMasterKey)?;
        Ok(Self::new(key))
    }

    /// Load the master key from `FLEET_SECRETS_MASTER_KEY`, or from the file
    /// named by `FLEET_SECRETS_MASTER_KEY_FILE`.
    pub fn from_env() -> Result<Self, CryptoError> {
        if let Ok(raw) = std::env::var("FLEET_SECRETS_MASTER_KEY") {
            return Self::from_base64(&raw);
        }

        if let Ok(path) = std::env::var("FLEET_SECRETS_MASTER_KEY_FILE") {
            let contents =
                std::fs::read_to_string(path).map_err(|_| CryptoError::InvalidMasterKey)?;
            return Self::from_base64(&contents);
        }

        Err(CryptoError::MissingMasterKey)
    }

    /// A box with a random key, for dev mode and tests.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_BYTES];
        rand::rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Seal `plaintext`, binding it to `context`.
    ///
    /// Output format: `v1:<base64(nonce || ciphertext)>`.
    pub fn seal(&self, plaintext: &str, context: &str) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::SealFailed)?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;

        let mut framed = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_VERSION}:{}", STANDARD.encode(framed)))
    }

    /// Open a value produced by [`SecretBox::seal`] with the same context.
    pub fn open(&self, sealed: &str, context: &str) -> Result<String, CryptoError> {
        let encoded = sealed
            .strip_prefix(SEALED_VERSION)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or(CryptoError::Malformed)?;
        let framed = STANDARD.decode(encoded).map_err(|_| CryptoError::Malformed)?;
        if framed.len() <= NONCE_BYTES {
            return Err(CryptoError::Malformed);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_BYTES);

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::OpenFailed)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::OpenFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_prefixes() {
        assert!(generate_registration_token().starts_with(REGISTRATION_TOKEN_PREFIX));
        assert!(generate_node_secret().starts_with(NODE_SECRET_PREFIX));
        assert_ne!(generate_node_secret(), generate_node_secret());
    }

    #[test]
    fn test_hash_token_is_stable_hex() {
        let hash = hash_token("flt_reg_abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("flt_reg_abc"));
        assert_ne!(hash, hash_token("flt_reg_abd"));
    }

    #[test]
    fn test_seal_and_open() {
        let sb = SecretBox::ephemeral();
        let sealed = sb.seal("s3cret", "app_1:DATABASE_URL").unwrap();
        assert!(sealed.starts_with("v1:"));
        assert_eq!(sb.open(&sealed, "app_1:DATABASE_URL").unwrap(), "s3cret");
    }

    #[test]
    fn test_open_with_wrong_context_fails() {
        let sb = SecretBox::ephemeral();
        let sealed = sb.seal("s3cret", "app_1:TOKEN").unwrap();
        assert!(matches!(
            sb.open(&sealed, "app_2:TOKEN"),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn test_open_with_other_key_fails() {
        let sealed = SecretBox::ephemeral().seal("s3cret", "ctx").unwrap();
        assert!(SecretBox::ephemeral().open(&sealed, "ctx").is_err());
    }

    #[test]
    fn test_malformed_inputs() {
        let sb = SecretBox::ephemeral();
        assert!(matches!(sb.open("plain", "ctx"), Err(CryptoError::Malformed)));
        assert!(matches!(sb.open("v1:@@@", "ctx"), Err(CryptoError::Malformed)));
        assert!(matches!(sb.open("v1:AAAA", "ctx"), Err(CryptoError::Malformed)));
    }

    #[test]
    fn test_master_key_from_base64() {
        let sb = SecretBox::from_base64("MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=").unwrap();
        let sealed = sb.seal("x", "y").unwrap();
        assert_eq!(sb.open(&sealed, "y").unwrap(), "x");
        assert!(matches!(
            SecretBox::from_base64("c2hvcnQ="),
            Err(CryptoError::InvalidMasterKey)
        ));
    }
}
