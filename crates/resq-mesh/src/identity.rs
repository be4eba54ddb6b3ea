//! Local identity and peer public keys with hybrid encryption
//!
//! Direct messages use a fresh AES-256-GCM content key per message. The
//! content key is wrapped for the recipient with an ephemeral X25519
//! Diffie-Hellman exchange against the recipient's static public key,
//! expanded through HKDF-SHA256 into an AES-256-GCM key-encryption key.

use crate::error::{MeshError, MeshResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// DER SubjectPublicKeyInfo header for an X25519 key (RFC 8410)
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

const KEY_WRAP_INFO: &[u8] = b"resq-mesh key wrap v1";

/// Encrypted payload plus the content key wrapped for its recipient
///
/// Both fields are base64 text as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBundle {
    pub wrapped_key: String,
    pub cipher_text: String,
}

/// Owns the local keypair and the nickname -> public key records
pub struct KeyStore {
    secret: StaticSecret,
    public: PublicKey,
    peer_keys: HashMap<String, PublicKey>,
}

impl KeyStore {
    /// Generate a fresh X25519 identity
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        info!("Generated local mesh identity");
        Self {
            secret,
            public,
            peer_keys: HashMap::new(),
        }
    }

    /// Local public key in its portable encoded form
    pub fn public_key_encoded(&self) -> String {
        encode_public_key(&self.public)
    }

    /// Record a peer's public key, replacing any earlier one
    pub fn store_peer_key(&mut self, nickname: &str, encoded: &str) -> MeshResult<()> {
        let key = decode_public_key(encoded)?;
        if self.peer_keys.insert(nickname.to_string(), key).is_some() {
            debug!(peer = %nickname, "Replaced public key");
        } else {
            debug!(peer = %nickname, "Stored public key");
        }
        Ok(())
    }

    pub fn remove_peer_key(&mut self, nickname: &str) -> bool {
        self.peer_keys.remove(nickname).is_some()
    }

    pub fn clear_peer_keys(&mut self) {
        self.peer_keys.clear();
    }

    pub fn has_key(&self, nickname: &str) -> bool {
        self.peer_keys.contains_key(nickname)
    }

    /// Nicknames with a known public key
    pub fn known_peers(&self) -> BTreeSet<String> {
        self.peer_keys.keys().cloned().collect()
    }

    /// Encrypt `plaintext` so that only `nickname` can read it
    ///
    /// Returns `Ok(None)` when no key is on record for that nickname.
    pub fn encrypt_for_peer(
        &self,
        nickname: &str,
        plaintext: &str,
    ) -> MeshResult<Option<EncryptedBundle>> {
        let Some(recipient) = self.peer_keys.get(nickname) else {
            return Ok(None);
        };

        let mut content_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut content_key);

        let sealed = seal(&content_key, plaintext.as_bytes())
            .and_then(|cipher_text| Ok((cipher_text, wrap_key(recipient, &content_key)?)));
        content_key.zeroize();
        let (cipher_text, wrapped_key) = sealed?;

        Ok(Some(EncryptedBundle {
            wrapped_key: STANDARD.encode(wrapped_key),
            cipher_text: STANDARD.encode(cipher_text),
        }))
    }

    /// Decrypt a bundle addressed to this identity
    pub fn decrypt_own(&self, bundle: &EncryptedBundle) -> MeshResult<String> {
        let wrapped = STANDARD
            .decode(&bundle.wrapped_key)
            .map_err(|e| MeshError::DecryptionFailed(format!("wrapped key: {}", e)))?;
        let sealed = STANDARD
            .decode(&bundle.cipher_text)
            .map_err(|e| MeshError::DecryptionFailed(format!("cipher text: {}", e)))?;

        let mut content_key = self.unwrap_key(&wrapped)?;
        let plaintext = open(&content_key, &sealed);
        content_key.zeroize();
        let plaintext = plaintext?;

        String::from_utf8(plaintext)
            .map_err(|e| MeshError::DecryptionFailed(format!("not UTF-8: {}", e)))
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> MeshResult<[u8; KEY_LEN]> {
        if wrapped.len() <= KEY_LEN + NONCE_LEN {
            return Err(MeshError::DecryptionFailed(format!(
                "wrapped key too short: {} bytes",
                wrapped.len()
            )));
        }

        let mut ephemeral = [0u8; KEY_LEN];
        ephemeral.copy_from_slice(&wrapped[..KEY_LEN]);
        let ephemeral = PublicKey::from(ephemeral);

        let shared = self.secret.diffie_hellman(&ephemeral);
        let kek = derive_kek(shared.as_bytes(), &ephemeral, &self.public)?;

        let key = open(&kek, &wrapped[KEY_LEN..])?;
        key.try_into().map_err(|k: Vec<u8>| {
            MeshError::DecryptionFailed(format!("unwrapped key has {} bytes", k.len()))
        })
    }
}

fn encode_public_key(key: &PublicKey) -> String {
    let mut der = Vec::with_capacity(X25519_SPKI_PREFIX.len() + KEY_LEN);
    der.extend_from_slice(&X25519_SPKI_PREFIX);
    der.extend_from_slice(key.as_bytes());
    STANDARD.encode(der)
}

fn decode_public_key(encoded: &str) -> MeshResult<PublicKey> {
    let der = STANDARD
        .decode(encoded.trim())
        .map_err(|e| MeshError::InvalidPublicKey(e.to_string()))?;

    let raw = der
        .strip_prefix(&X25519_SPKI_PREFIX[..])
        .ok_or_else(|| MeshError::InvalidPublicKey("not an X25519 SubjectPublicKeyInfo".into()))?;

    let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| {
        MeshError::InvalidPublicKey(format!("expected {} key bytes, got {}", KEY_LEN, raw.len()))
    })?;

    Ok(PublicKey::from(bytes))
}

/// Wrap `content_key` for `recipient`: ephemeral public || nonce || sealed key
fn wrap_key(recipient: &PublicKey, content_key: &[u8; KEY_LEN]) -> MeshResult<Vec<u8>> {
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(recipient);
    let kek = derive_kek(shared.as_bytes(), &ephemeral_public, recipient)?;

    let sealed = seal(&kek, content_key)?;

    let mut wrapped = Vec::with_capacity(KEY_LEN + sealed.len());
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

fn derive_kek(
    shared: &[u8; KEY_LEN],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> MeshResult<[u8; KEY_LEN]> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut kek = [0u8; KEY_LEN];
    hk.expand(KEY_WRAP_INFO, &mut kek)
        .map_err(|e| MeshError::EncryptionFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(kek)
}

/// AES-256-GCM encrypt with a random nonce; output is nonce || ciphertext+tag
fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> MeshResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| MeshError::EncryptionFailed(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| MeshError::EncryptionFailed(format!("AES-GCM encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> MeshResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(MeshError::DecryptionFailed("missing nonce".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| MeshError::DecryptionFailed(format!("Failed to create cipher: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| MeshError::DecryptionFailed(format!("AES-GCM decryption failed: {}", e)))
}
