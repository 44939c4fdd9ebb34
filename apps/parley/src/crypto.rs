//! Passphrase-keyed end-to-end encryption for chat text.
//!
//! Every participant who knows the passphrase derives the same AES-256-GCM key from
//! it and the room id, so no handshake is needed. Encrypted chat travels as
//! `WIRE_PREFIX` followed by the JSON [`E2eeEnvelope`]; text without the prefix is
//! legacy plaintext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::MeshConfig;

pub const WIRE_PREFIX: &str = "e2ee:v1:";
pub const ENVELOPE_VERSION: u32 = 1;
pub const ALGORITHM: &str = "AES-GCM";
const SALT_PREFIX: &str = "salt:";
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const UNDECRYPTABLE_PLACEHOLDER: &str = "cannot decrypt message";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("message too long: {len} characters (max {max})")]
    MessageTooLong { len: usize, max: usize },
    #[error("encrypted envelope too large: {len} characters (max {max})")]
    EnvelopeTooLarge { len: usize, max: usize },
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("unsupported envelope: {0}")]
    UnsupportedEnvelope(String),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl CryptoError {
    /// Text shown to the user in place of content that could not be processed.
    pub fn user_message(&self) -> &'static str {
        match self {
            CryptoError::MessageTooLong { .. } => "message is too long",
            CryptoError::EnvelopeTooLarge { .. } => "message is too large to send",
            CryptoError::KeyDerivation(_) => "encryption is unavailable",
            CryptoError::DecryptionFailed
            | CryptoError::MalformedEnvelope(_)
            | CryptoError::UnsupportedEnvelope(_) => UNDECRYPTABLE_PLACEHOLDER,
        }
    }
}

/// Symmetric room key. Never persisted and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|err| CryptoError::KeyDerivation(format!("invalid key: {err}")))
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2eeEnvelope {
    pub v: u32,
    pub alg: String,
    pub iv: String,
    pub content: String,
}

/// Inbound chat text after prefix inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireText<'a> {
    Plain(&'a str),
    Encrypted(E2eeEnvelope),
}

/// First 16 bytes of SHA-256("salt:" + room id).
pub fn room_salt(room_id: &str) -> [u8; SALT_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(SALT_PREFIX.as_bytes());
    hasher.update(room_id.as_bytes());
    let digest = hasher.finalize();
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&digest[..SALT_LEN]);
    salt
}

/// PBKDF2-HMAC-SHA256 over the passphrase. CPU bound; async callers go through
/// [`KeyCache`] which runs it on the blocking pool.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> RoomKey {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    RoomKey(key)
}

/// Associated data binding a ciphertext to its room and author.
pub fn associated_data(room_id: &str, user_id: &str) -> String {
    format!("{room_id}|{user_id}")
}

pub fn encrypt(
    plaintext: &str,
    key: &RoomKey,
    aad: &str,
    max_chars: usize,
) -> Result<E2eeEnvelope, CryptoError> {
    let len = plaintext.chars().count();
    if len > max_chars {
        return Err(CryptoError::MessageTooLong {
            len,
            max: max_chars,
        });
    }

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let ciphertext = key
        .cipher()?
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext.as_bytes(),
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(E2eeEnvelope {
        v: ENVELOPE_VERSION,
        alg: ALGORITHM.to_string(),
        iv: BASE64_STANDARD.encode(iv),
        content: BASE64_STANDARD.encode(ciphertext),
    })
}

pub fn decrypt(envelope: &E2eeEnvelope, key: &RoomKey, aad: &str) -> Result<String, CryptoError> {
    if envelope.v != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedEnvelope(format!(
            "version {}",
            envelope.v
        )));
    }
    if envelope.alg != ALGORITHM {
        return Err(CryptoError::UnsupportedEnvelope(format!(
            "algorithm {}",
            envelope.alg
        )));
    }
    let iv = BASE64_STANDARD
        .decode(envelope.iv.as_bytes())
        .map_err(|err| CryptoError::MalformedEnvelope(format!("iv encoding: {err}")))?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::MalformedEnvelope(format!(
            "iv length {}",
            iv.len()
        )));
    }
    let ciphertext = BASE64_STANDARD
        .decode(envelope.content.as_bytes())
        .map_err(|err| CryptoError::MalformedEnvelope(format!("content encoding: {err}")))?;
    let plaintext = key
        .cipher()?
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

pub fn pack(envelope: &E2eeEnvelope, max_wire_chars: usize) -> Result<String, CryptoError> {
    let json = serde_json::to_string(envelope)
        .map_err(|err| CryptoError::MalformedEnvelope(err.to_string()))?;
    let packed = format!("{WIRE_PREFIX}{json}");
    let len = packed.chars().count();
    if len > max_wire_chars {
        return Err(CryptoError::EnvelopeTooLarge {
            len,
            max: max_wire_chars,
        });
    }
    Ok(packed)
}

pub fn is_encrypted(text: &str) -> bool {
    text.starts_with(WIRE_PREFIX)
}

/// Cheap prefix check first; only prefixed text is parsed as an envelope.
pub fn unpack(text: &str) -> Result<WireText<'_>, CryptoError> {
    match text.strip_prefix(WIRE_PREFIX) {
        None => Ok(WireText::Plain(text)),
        Some(json) => serde_json::from_str(json)
            .map(WireText::Encrypted)
            .map_err(|err| CryptoError::MalformedEnvelope(err.to_string())),
    }
}

/// Lazily derived key for one room membership.
#[derive(Debug)]
pub struct KeyCache {
    room_id: String,
    passphrase: String,
    iterations: u32,
    key: OnceCell<RoomKey>,
}

impl KeyCache {
    /// A missing or blank passphrase falls back to the room id.
    pub fn new(room_id: &str, passphrase: Option<&str>, iterations: u32) -> Self {
        let passphrase = passphrase
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(room_id)
            .to_string();
        Self {
            room_id: room_id.to_string(),
            passphrase,
            iterations,
            key: OnceCell::new(),
        }
    }

    pub async fn key(&self) -> Result<&RoomKey, CryptoError> {
        self.key
            .get_or_try_init(|| async {
                let salt = room_salt(&self.room_id);
                let passphrase = self.passphrase.clone();
                let iterations = self.iterations;
                tracing::debug!(target: "parley::crypto", iterations, "deriving room key");
                tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt, iterations))
                    .await
                    .map_err(|err| CryptoError::KeyDerivation(err.to_string()))
            })
            .await
    }

    /// Encrypts and packs outgoing chat authored by `user_id`.
    pub async fn seal(
        &self,
        plaintext: &str,
        user_id: &str,
        config: &MeshConfig,
    ) -> Result<String, CryptoError> {
        let key = self.key().await?;
        let aad = associated_data(&self.room_id, user_id);
        let envelope = encrypt(plaintext, key, &aad, config.max_plaintext_chars)?;
        pack(&envelope, config.max_wire_chars)
    }

    /// Opens inbound chat authored by `sender_id`.
    pub async fn open(&self, text: &str, sender_id: &str) -> Result<ChatBody, CryptoError> {
        match unpack(text)? {
            WireText::Plain(plain) => Ok(ChatBody::Plaintext(plain.to_string())),
            WireText::Encrypted(envelope) => {
                let key = self.key().await?;
                let aad = associated_data(&self.room_id, sender_id);
                decrypt(&envelope, key, &aad).map(ChatBody::Decrypted)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatBody {
    Decrypted(String),
    /// Legacy sender without encryption.
    Plaintext(String),
}
