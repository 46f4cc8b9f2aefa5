//! Key material loading and crypto error taxonomy.

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// Default key pair id when `COOKIE_KID` is unset.
pub const DEFAULT_KID: &str = "rsa-2025-01";

/// Errors from envelope operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The required key (public for seal, private for open) is not configured.
    #[error("key missing: {0}")]
    KeyMissing(&'static str),

    /// The envelope was produced under a different key pair.
    #[error("kid mismatch: envelope {envelope}, configured {configured}")]
    KidMismatch {
        /// `kid` recorded in the envelope.
        envelope: String,
        /// `kid` of the configured key pair.
        configured: String,
    },

    /// Authenticated decryption or key unwrap failed.
    #[error("decrypt failed: {0}")]
    DecryptFailed(String),

    /// The payload or key material could not be parsed.
    #[error("parse failed: {0}")]
    ParseFailed(String),
}

impl CryptoError {
    /// The stable wire kind for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyMissing(_) => "key_missing",
            Self::KidMismatch { .. } => "kid_mismatch",
            Self::DecryptFailed(_) => "decrypt_failed",
            Self::ParseFailed(_) => "parse_failed",
        }
    }
}

/// Loaded RSA key material for one key pair id.
///
/// A deployment that only seals (workers) carries the public half; only the
/// server that opens envelopes holds the private half.
#[derive(Debug)]
pub struct KeyMaterial {
    kid: String,
    public: Option<RsaPublicKey>,
    private: Option<RsaPrivateKey>,
}

impl KeyMaterial {
    /// Build key material from PEM strings.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ParseFailed`] when a supplied PEM does not
    /// parse as an RSA key.
    pub fn from_pems(
        kid: impl Into<String>,
        public_pem: Option<&str>,
        private_pem: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let public = public_pem
            .map(|pem| {
                RsaPublicKey::from_public_key_pem(pem)
                    .map_err(|e| CryptoError::ParseFailed(format!("public key pem: {e}")))
            })
            .transpose()?;
        let private = private_pem.map(parse_private_pem).transpose()?;
        // Derive the public half from the private key when only that is given.
        let public = match (public, &private) {
            (Some(p), _) => Some(p),
            (None, Some(sk)) => Some(RsaPublicKey::from(sk)),
            (None, None) => None,
        };
        Ok(Self {
            kid: kid.into(),
            public,
            private,
        })
    }

    /// Load key material from the process environment.
    ///
    /// Reads `COOKIE_KID`, `COOKIE_PUBLIC_KEY_PEM`, and the private key from
    /// `COOKIE_PRIVATE_KEY_PEM` or, failing that, the file named by
    /// `COOKIE_PRIVATE_KEY_PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ParseFailed`] when configured PEM material is
    /// malformed.
    pub fn from_env() -> Result<Self, CryptoError> {
        let kid = std::env::var("COOKIE_KID").unwrap_or_else(|_| DEFAULT_KID.to_string());
        let public_pem = std::env::var("COOKIE_PUBLIC_KEY_PEM").ok();
        let private_pem = std::env::var("COOKIE_PRIVATE_KEY_PEM").ok().or_else(|| {
            std::env::var("COOKIE_PRIVATE_KEY_PATH")
                .ok()
                .and_then(|path| std::fs::read_to_string(path).ok())
        });
        Self::from_pems(kid, public_pem.as_deref(), private_pem.as_deref())
    }

    /// The configured key pair id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The public key, if configured.
    #[must_use]
    pub fn public(&self) -> Option<&RsaPublicKey> {
        self.public.as_ref()
    }

    /// The private key, if configured. Never exposed beyond this process.
    #[must_use]
    pub(crate) fn private(&self) -> Option<&RsaPrivateKey> {
        self.private.as_ref()
    }

    /// Re-encode the public key as SPKI PEM for the discovery endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyMissing`] when no public key is configured.
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        let key = self.public().ok_or(CryptoError::KeyMissing("public"))?;
        key.to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::ParseFailed(format!("public key encode: {e}")))
    }
}

fn parse_private_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::ParseFailed(format!("private key pem: {e}")))
}
