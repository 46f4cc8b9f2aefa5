//! Seal and open envelope-encrypted blobs.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::Oaep;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keys::{CryptoError, KeyMaterial};

/// An envelope-encrypted payload as persisted and shipped over HTTP.
///
/// All four fields are base64; `kid` names the RSA key pair that wrapped the
/// data key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// AES-256-GCM ciphertext of the JSON payload.
    pub ciphertext: String,
    /// 96-bit GCM nonce.
    pub nonce: String,
    /// RSA-OAEP-SHA256-wrapped 256-bit data key.
    pub wrapped_key: String,
    /// Key pair identifier.
    pub kid: String,
}

/// Seals and opens envelopes under one [`KeyMaterial`].
pub struct EnvelopeCrypto {
    keys: KeyMaterial,
}

impl EnvelopeCrypto {
    /// Wrap loaded key material.
    #[must_use]
    pub fn new(keys: KeyMaterial) -> Self {
        Self { keys }
    }

    /// Load key material from the environment.
    ///
    /// # Errors
    ///
    /// Propagates [`CryptoError::ParseFailed`] for malformed PEM material.
    pub fn from_env() -> Result<Self, CryptoError> {
        Ok(Self::new(KeyMaterial::from_env()?))
    }

    /// The configured key pair id.
    #[must_use]
    pub fn kid(&self) -> &str {
        self.keys.kid()
    }

    /// Borrow the underlying key material.
    #[must_use]
    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    /// Encrypt a JSON-serializable payload into a [`SealedEnvelope`].
    ///
    /// Generates a fresh 256-bit data key and 96-bit nonce per call.
    ///
    /// # Errors
    ///
    /// `key_missing` without a public key; `parse_failed` when the payload
    /// does not serialize; `decrypt_failed` when a primitive rejects the
    /// operation.
    pub fn seal<T: Serialize>(&self, payload: &T) -> Result<SealedEnvelope, CryptoError> {
        let public = self
            .keys
            .public()
            .ok_or(CryptoError::KeyMissing("public"))?;

        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| CryptoError::ParseFailed(format!("payload serialize: {e}")))?;

        let mut data_key = [0u8; 32];
        OsRng.fill_bytes(&mut data_key);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|e| CryptoError::DecryptFailed(format!("cipher init: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| CryptoError::DecryptFailed(format!("aead encrypt: {e}")))?;

        let wrapped_key = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &data_key)
            .map_err(|e| CryptoError::DecryptFailed(format!("key wrap: {e}")))?;

        Ok(SealedEnvelope {
            ciphertext: B64.encode(ciphertext),
            nonce: B64.encode(nonce_bytes),
            wrapped_key: B64.encode(wrapped_key),
            kid: self.keys.kid().to_string(),
        })
    }

    /// Decrypt a [`SealedEnvelope`] back into its JSON payload.
    ///
    /// # Errors
    ///
    /// `kid_mismatch` when the envelope names a different key pair;
    /// `key_missing` without a private key; `decrypt_failed` on unwrap or
    /// AEAD failure (including tampering); `parse_failed` when the plaintext
    /// is not the expected JSON shape.
    pub fn open<T: DeserializeOwned>(&self, envelope: &SealedEnvelope) -> Result<T, CryptoError> {
        if envelope.kid != self.keys.kid() {
            return Err(CryptoError::KidMismatch {
                envelope: envelope.kid.clone(),
                configured: self.keys.kid().to_string(),
            });
        }
        let private = self
            .keys
            .private()
            .ok_or(CryptoError::KeyMissing("private"))?;

        let wrapped = decode_b64(&envelope.wrapped_key, "wrapped_key")?;
        let nonce = decode_b64(&envelope.nonce, "nonce")?;
        let ciphertext = decode_b64(&envelope.ciphertext, "ciphertext")?;

        let data_key = private
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|e| CryptoError::DecryptFailed(format!("key unwrap: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|e| CryptoError::DecryptFailed(format!("cipher init: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|e| CryptoError::DecryptFailed(format!("aead decrypt: {e}")))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::ParseFailed(format!("payload parse: {e}")))
    }
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(value.trim())
        .map_err(|e| CryptoError::ParseFailed(format!("{field} base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use serde_json::json;

    fn crypto_with_keys(kid: &str) -> EnvelopeCrypto {
        let mut rng = rand::thread_rng();
        let sk = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pk = RsaPublicKey::from(&sk);
        let keys = KeyMaterial::from_pems(
            kid,
            Some(&pk.to_public_key_pem(LineEnding::LF).unwrap()),
            Some(&sk.to_pkcs8_pem(LineEnding::LF).unwrap()),
        )
        .unwrap();
        EnvelopeCrypto::new(keys)
    }

    #[test]
    fn seal_open_roundtrip() {
        let crypto = crypto_with_keys("kid-rt");
        let payload = json!({
            "cookies": [{"name": "SID", "value": "abc", "domain": ".google.com"}],
            "origins": [],
        });
        let envelope = crypto.seal(&payload).unwrap();
        assert_eq!(envelope.kid, "kid-rt");
        let back: serde_json::Value = crypto.open(&envelope).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn fresh_key_and_nonce_per_seal() {
        let crypto = crypto_with_keys("kid-n");
        let payload = json!({"a": 1});
        let first = crypto.seal(&payload).unwrap();
        let second = crypto.seal(&payload).unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.wrapped_key, second.wrapped_key);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn kid_mismatch_rejected() {
        let sealer = crypto_with_keys("kid-a");
        let opener = crypto_with_keys("kid-b");
        let envelope = sealer.seal(&json!({"x": true})).unwrap();
        let err = opener.open::<serde_json::Value>(&envelope).unwrap_err();
        assert_eq!(err.kind(), "kid_mismatch");
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let crypto = crypto_with_keys("kid-t");
        let mut envelope = crypto.seal(&json!({"x": 1})).unwrap();
        let mut raw = B64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = B64.encode(raw);
        let err = crypto.open::<serde_json::Value>(&envelope).unwrap_err();
        assert_eq!(err.kind(), "decrypt_failed");
    }

    #[test]
    fn open_without_private_key_is_key_missing() {
        let full = crypto_with_keys("kid-p");
        let envelope = full.seal(&json!({"x": 1})).unwrap();

        let public_only = EnvelopeCrypto::new(
            KeyMaterial::from_pems("kid-p", Some(&full.keys().public_key_pem().unwrap()), None)
                .unwrap(),
        );
        let err = public_only.open::<serde_json::Value>(&envelope).unwrap_err();
        assert_eq!(err.kind(), "key_missing");
    }

    #[test]
    fn seal_without_public_key_is_key_missing() {
        let crypto = EnvelopeCrypto::new(KeyMaterial::from_pems("kid-x", None, None).unwrap());
        let err = crypto.seal(&json!({"x": 1})).unwrap_err();
        assert_eq!(err.kind(), "key_missing");
    }

    #[test]
    fn wrong_type_payload_is_parse_failed() {
        #[derive(serde::Deserialize, Debug)]
        struct Strict {
            #[allow(dead_code)]
            must_exist: String,
        }
        let crypto = crypto_with_keys("kid-s");
        let envelope = crypto.seal(&json!({"other": 1})).unwrap();
        let err = crypto.open::<Strict>(&envelope).unwrap_err();
        assert_eq!(err.kind(), "parse_failed");
    }

    #[test]
    fn garbage_base64_is_parse_failed() {
        let crypto = crypto_with_keys("kid-g");
        let mut envelope = crypto.seal(&json!({"x": 1})).unwrap();
        envelope.nonce = "%%%not-base64%%%".into();
        let err = crypto.open::<serde_json::Value>(&envelope).unwrap_err();
        assert_eq!(err.kind(), "parse_failed");
    }

    #[test]
    fn envelope_serde_roundtrip() {
        let envelope = SealedEnvelope {
            ciphertext: "YQ==".into(),
            nonce: "Yg==".into(),
            wrapped_key: "Yw==".into(),
            kid: "rsa-2025-01".into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: SealedEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
