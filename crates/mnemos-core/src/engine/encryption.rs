// ── Mnemos: Envelope Encryption ────────────────────────────────────────────
//
// Everything the engine persists passes through `Vault::seal`.
//
// Key hierarchy:
//   master secret ──HKDF-SHA256(salt)──► KEK        (wraps per-blob data keys)
//                                    ├─► index key  (HMAC blind indexes)
//                                    └─► check key  (key check value)
//
// Sealed blob layout (all lengths fixed except the payload):
//   version(1) ‖ wrapNonce(12) ‖ wrappedKey(48) ‖ dataNonce(12) ‖ ciphertext+tag
//
// Each blob gets a fresh random 256-bit data key (DEK). The DEK is encrypted
// under the KEK with AES-256-GCM; the payload is encrypted under the DEK with
// the wrapped key as associated data, so a payload cannot be spliced onto
// another blob's key. The salt is stored beside the data; it is not secret.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::atoms::constants::{ENVELOPE_VERSION, KEYRING_SERVICE, KEYRING_USER};
use crate::atoms::error::{EngineError, EngineResult};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const WRAPPED_KEY_LEN: usize = KEY_LEN + TAG_LEN;
const HEADER_LEN: usize = 1 + NONCE_LEN + WRAPPED_KEY_LEN + NONCE_LEN;

pub const SALT_LEN: usize = 16;

const KEK_INFO: &[u8] = b"mnemos/kek/v1";
const INDEX_INFO: &[u8] = b"mnemos/blind-index/v1";
const CHECK_INFO: &[u8] = b"mnemos/key-check/v1";
const CHECK_MESSAGE: &[u8] = b"mnemos key check";

type HmacSha256 = Hmac<Sha256>;

// ═════════════════════════════════════════════════════════════════════════════
// Randomness
// ═════════════════════════════════════════════════════════════════════════════

fn random_bytes<const N: usize>() -> EngineResult<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| EngineError::Other(format!("OS random source failed: {}", e)))?;
    Ok(buf)
}

/// Fresh per-store salt for key derivation.
pub fn generate_salt() -> EngineResult<[u8; SALT_LEN]> {
    random_bytes::<SALT_LEN>()
}

// ═════════════════════════════════════════════════════════════════════════════
// Master Secret
// ═════════════════════════════════════════════════════════════════════════════

/// Input keying material. Wiped from memory on drop.
pub enum MasterSecret {
    Passphrase(Zeroizing<String>),
    Bytes(Zeroizing<Vec<u8>>),
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterSecret::Passphrase(_) => write!(f, "MasterSecret::Passphrase(<redacted>)"),
            MasterSecret::Bytes(_) => write!(f, "MasterSecret::Bytes(<redacted>)"),
        }
    }
}

impl MasterSecret {
    pub fn passphrase(phrase: impl Into<String>) -> EngineResult<Self> {
        let phrase = Zeroizing::new(phrase.into());
        if phrase.trim().is_empty() {
            return Err(EngineError::InvalidInput("empty passphrase".into()));
        }
        Ok(MasterSecret::Passphrase(phrase))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> EngineResult<Self> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.is_empty() {
            return Err(EngineError::InvalidInput("empty master secret".into()));
        }
        Ok(MasterSecret::Bytes(bytes))
    }

    /// Read a passphrase from an environment variable.
    pub fn from_env(var: &str) -> EngineResult<Self> {
        let value = std::env::var(var)
            .map_err(|_| EngineError::Config(format!("environment variable {} not set", var)))?;
        Self::passphrase(value)
    }

    /// Get or create a random 256-bit master secret in the OS keychain.
    pub fn from_keyring() -> EngineResult<Self> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER).map_err(|e| {
            error!("[mnemos:crypto] Keyring init failed: {}", e);
            EngineError::Keyring(format!("Keyring init failed: {}", e))
        })?;

        match entry.get_password() {
            Ok(encoded) => {
                let key = Zeroizing::new(encoded);
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(key.as_bytes())
                    .map_err(|e| {
                        error!("[mnemos:crypto] Failed to decode master secret: {}", e);
                        EngineError::Keyring(format!("Failed to decode master secret: {}", e))
                    })?;
                Self::from_bytes(bytes)
            }
            Err(keyring::Error::NoEntry) => {
                let key = Zeroizing::new(random_bytes::<KEY_LEN>()?);
                let encoded =
                    Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(&key[..]));
                entry.set_password(&encoded).map_err(|e| {
                    error!("[mnemos:crypto] Failed to store master secret: {}", e);
                    EngineError::Keyring(format!("Failed to store master secret: {}", e))
                })?;
                info!("[mnemos:crypto] Created new master secret in OS keychain");
                Self::from_bytes(key.to_vec())
            }
            Err(e) => {
                error!("[mnemos:crypto] OS keychain error: {}", e);
                Err(EngineError::Keyring(e.to_string()))
            }
        }
    }

    fn material(&self) -> &[u8] {
        match self {
            MasterSecret::Passphrase(p) => p.as_bytes(),
            MasterSecret::Bytes(b) => b.as_slice(),
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Vault
// ═════════════════════════════════════════════════════════════════════════════

/// Derived key set for one store. Keys are zeroized on drop.
pub struct Vault {
    kek: Zeroizing<[u8; KEY_LEN]>,
    index_key: Zeroizing<[u8; KEY_LEN]>,
    check_key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Vault(<keys redacted>)")
    }
}

fn expand(hk: &Hkdf<Sha256>, info: &[u8]) -> EngineResult<Zeroizing<[u8; KEY_LEN]>> {
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| EngineError::Other(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

fn cipher(key: &[u8]) -> EngineResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|_| EngineError::Other("AES key must be 32 bytes".into()))
}

impl Vault {
    /// Derive all keys once. Called when a store is opened.
    pub fn derive(secret: &MasterSecret, salt: &[u8]) -> EngineResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret.material());
        Ok(Self {
            kek: expand(&hk, KEK_INFO)?,
            index_key: expand(&hk, INDEX_INFO)?,
            check_key: expand(&hk, CHECK_INFO)?,
        })
    }

    /// Encrypt under a fresh data key.
    pub fn seal(&self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let dek = Zeroizing::new(random_bytes::<KEY_LEN>()?);
        let wrap_nonce = random_bytes::<NONCE_LEN>()?;
        let data_nonce = random_bytes::<NONCE_LEN>()?;
        let version = [ENVELOPE_VERSION];

        let wrapped = cipher(&self.kek[..])?
            .encrypt(
                Nonce::from_slice(&wrap_nonce),
                Payload {
                    msg: &dek[..],
                    aad: &version,
                },
            )
            .map_err(|e| EngineError::Other(format!("Key wrap failed: {}", e)))?;

        let ciphertext = cipher(&dek[..])?
            .encrypt(
                Nonce::from_slice(&data_nonce),
                Payload {
                    msg: plaintext,
                    aad: &wrapped,
                },
            )
            .map_err(|e| EngineError::Other(format!("AES-256-GCM encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.push(ENVELOPE_VERSION);
        blob.extend_from_slice(&wrap_nonce);
        blob.extend_from_slice(&wrapped);
        blob.extend_from_slice(&data_nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt and authenticate a sealed blob.
    pub fn open(&self, blob: &[u8]) -> EngineResult<Vec<u8>> {
        if blob.len() < HEADER_LEN + TAG_LEN {
            return Err(EngineError::Decryption("sealed blob too short".into()));
        }
        if blob[0] != ENVELOPE_VERSION {
            return Err(EngineError::Decryption(format!(
                "unsupported envelope version {}",
                blob[0]
            )));
        }
        let (wrap_nonce, rest) = blob[1..].split_at(NONCE_LEN);
        let (wrapped, rest) = rest.split_at(WRAPPED_KEY_LEN);
        let (data_nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let version = [ENVELOPE_VERSION];

        let dek = cipher(&self.kek[..])?
            .decrypt(
                Nonce::from_slice(wrap_nonce),
                Payload {
                    msg: wrapped,
                    aad: &version,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| EngineError::Decryption("data key unwrap failed".into()))?;

        cipher(&dek[..])?
            .decrypt(
                Nonce::from_slice(data_nonce),
                Payload {
                    msg: ciphertext,
                    aad: wrapped,
                },
            )
            .map_err(|_| EngineError::Decryption("payload authentication failed".into()))
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> EngineResult<Vec<u8>> {
        let plain = Zeroizing::new(serde_json::to_vec(value)?);
        self.seal(&plain)
    }

    /// Open and deserialize. A payload that authenticates but does not parse
    /// is treated as corrupt.
    pub fn open_json<T: DeserializeOwned>(&self, blob: &[u8]) -> EngineResult<T> {
        let plain = Zeroizing::new(self.open(blob)?);
        serde_json::from_slice(&plain)
            .map_err(|e| EngineError::Decryption(format!("corrupt payload: {}", e)))
    }

    /// Keyed, deterministic row key. Lets the graph table be addressed by
    /// triple without storing the triple in the clear.
    pub fn blind_index(&self, parts: &[&str]) -> EngineResult<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.index_key[..])
            .map_err(|e| EngineError::Other(format!("HMAC init failed: {}", e)))?;
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                mac.update(&[0x1f]);
            }
            mac.update(part.as_bytes());
        }
        let tag = mac.finalize().into_bytes();
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(tag))
    }

    /// Value stored at creation to detect a wrong master secret on reopen.
    pub fn key_check(&self) -> EngineResult<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.check_key[..])
            .map_err(|e| EngineError::Other(format!("HMAC init failed: {}", e)))?;
        mac.update(CHECK_MESSAGE);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    pub fn verify_key_check(&self, stored: &[u8]) -> EngineResult<()> {
        let computed = self.key_check()?;
        if bool::from(computed.as_slice().ct_eq(stored)) {
            Ok(())
        } else {
            Err(EngineError::Decryption(
                "master secret does not match this store".into(),
            ))
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Tests
// ═════════════════════════════════════════════════════════════════════════════
