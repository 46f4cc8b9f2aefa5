//! Envelope encryption for persisted browser session state.
//!
//! Every persisted blob is sealed with a two-layer scheme: a fresh 256-bit
//! data key encrypts the JSON payload with AES-256-GCM (96-bit nonce, empty
//! AAD), and the data key is wrapped with RSA-OAEP-SHA256. The emitted
//! envelope carries base64 `ciphertext`, `nonce`, `wrapped_key`, and the key
//! pair id `kid`.
//!
//! Private keys are only ever read server-side and never cross a channel.

pub mod envelope;
pub mod keys;

pub use envelope::{EnvelopeCrypto, SealedEnvelope};
pub use keys::{CryptoError, KeyMaterial, DEFAULT_KID};
