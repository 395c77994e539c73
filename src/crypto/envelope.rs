//! Hybrid RSA/AES envelope codec (C1, one-shot).
//!
//! Every message crossing the relay travels as an [`EnvelopeRecord`]: a
//! per-message AES-256 session key wrapped under the recipient's RSA public
//! key, plus the AES-CBC (or, for the authenticated variant, AES-256-GCM)
//! ciphertext. The relay forwards these records without ever holding the
//! AES key or the plaintext.

use std::sync::Mutex;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{aead::Aead, aead::KeyInit as _, Aes256Gcm, Nonce as GcmNonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::iv_guard::IvGuard;
use crate::policy::errors::RelayError;

/// Tracks every IV/nonce drawn by the one-shot codec so a same-process
/// collision is retried rather than silently reused (§3). The one-shot
/// path has no session object to hang this off, unlike the streaming
/// codec's per-`StreamSession` guard, so it tracks across the whole
/// process instead.
static RECENT_IVS: Lazy<Mutex<IvGuard>> = Lazy::new(|| Mutex::new(IvGuard::new()));

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

/// The wire record defined in §3: every blob field is base64, and the
/// higher-layer fields (`model`, `stream`, …) ride alongside for C5/C6 to
/// read without touching the ciphertext.
///
/// `final` is a reserved word in Rust, hence the rename.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvelopeRecord {
    pub ciphertext: String,
    pub cipherkey: String,
    pub iv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_session_id: Option<String>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_chunk: Option<bool>,
    /// `true` selects the AES-256-GCM authenticated variant; absent/`false`
    /// is plain AES-CBC. Not part of spec.md's literal schema table but
    /// required to discriminate the two at decrypt time, so it rides as an
    /// internal-only field excluded when empty.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aead: bool,
    /// Present only for the OpenAI adapter's plaintext mode (§4.6): carries
    /// the JSON payload directly with no RSA/AES wrapping, for test and
    /// non-sensitive use. When set, `ciphertext`/`cipherkey`/`iv` are empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plaintext: Option<serde_json::Value>,
}

impl EnvelopeRecord {
    pub fn stub_plaintext(value: serde_json::Value) -> Self {
        Self {
            plaintext: Some(value),
            ..Default::default()
        }
    }

    pub fn is_plaintext_stub(&self) -> bool {
        self.plaintext.is_some()
    }
}

/// Input accepted by [`encrypt`] (§4.1): raw bytes are carried unchanged,
/// strings are UTF-8 encoded, anything else is JSON-serialized with stable
/// (sorted) key ordering — `serde_json::Value`'s default map representation
/// already sorts keys, so no extra work is needed here.
pub enum Plaintext {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Plaintext {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Plaintext::Bytes(b) => b,
            Plaintext::Text(s) => s.into_bytes(),
            Plaintext::Json(v) => serde_json::to_vec(&v).unwrap_or_default(),
        }
    }
}

/// Output of [`decrypt`] (§9 design note: tagged variant, not an `any`).
#[derive(Debug, Clone, PartialEq)]
pub enum Decrypted {
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// Encrypts `plaintext` for `peer_public_key` with AES-256-CBC + RSA-OAEP.
pub fn encrypt(plaintext: Plaintext, peer_public_key: &RsaPublicKey) -> Result<EnvelopeRecord, RelayError> {
    let bytes = plaintext.into_bytes();
    encrypt_bytes(&bytes, peer_public_key, false)
}

/// Encrypts `plaintext` using the authenticated AES-256-GCM variant (§4.1).
pub fn encrypt_authenticated(
    plaintext: Plaintext,
    peer_public_key: &RsaPublicKey,
) -> Result<EnvelopeRecord, RelayError> {
    let bytes = plaintext.into_bytes();
    encrypt_bytes(&bytes, peer_public_key, true)
}

fn encrypt_bytes(
    plaintext: &[u8],
    peer_public_key: &RsaPublicKey,
    aead: bool,
) -> Result<EnvelopeRecord, RelayError> {
    let mut aes_key = [0u8; AES_KEY_LEN];
    OsRng.fill_bytes(&mut aes_key);

    if aead {
        let nonce_bytes = RECENT_IVS.lock().unwrap().fresh(GCM_NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&aes_key).map_err(|_| RelayError::Internal)?;
        let nonce = GcmNonce::from_slice(&nonce_bytes);
        let ct = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| RelayError::Internal)?;
        finish_envelope(&aes_key, &nonce_bytes, &ct, peer_public_key, true)
    } else {
        let iv = RECENT_IVS.lock().unwrap().fresh(IV_LEN);
        let iv_arr: [u8; IV_LEN] = iv.as_slice().try_into().expect("IvGuard::fresh returns IV_LEN bytes");
        let ct = Aes256CbcEnc::new(&aes_key.into(), &iv_arr.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        finish_envelope(&aes_key, &iv_arr, &ct, peer_public_key, false)
    }
}

fn finish_envelope(
    aes_key: &[u8],
    iv_or_nonce: &[u8],
    ciphertext: &[u8],
    peer_public_key: &RsaPublicKey,
    aead: bool,
) -> Result<EnvelopeRecord, RelayError> {
    let key_b64 = B64.encode(aes_key);
    let cipherkey = peer_public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key_b64.as_bytes())
        .map_err(|_| RelayError::Internal)?;

    Ok(EnvelopeRecord {
        ciphertext: B64.encode(ciphertext),
        cipherkey: B64.encode(cipherkey),
        iv: B64.encode(iv_or_nonce),
        aead,
        ..Default::default()
    })
}

/// Decrypts `record` with `own_private_key`, per §4.1's fallback ladder:
/// parsed JSON, then UTF-8 text, then raw bytes.
pub fn decrypt(record: &EnvelopeRecord, own_private_key: &RsaPrivateKey) -> Result<Decrypted, RelayError> {
    let plaintext = decrypt_to_bytes(record, own_private_key)?;
    Ok(classify(plaintext))
}

/// Decrypts `record` and returns raw bytes without the JSON/UTF-8
/// classification — used by the streaming path, which always deals in
/// opaque chunk bytes.
pub fn decrypt_to_bytes(
    record: &EnvelopeRecord,
    own_private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, RelayError> {
    if record.ciphertext.is_empty() {
        return Err(RelayError::MissingField("ciphertext"));
    }
    if record.cipherkey.is_empty() {
        return Err(RelayError::MissingField("cipherkey"));
    }
    if record.iv.is_empty() {
        return Err(RelayError::MissingField("iv"));
    }

    let cipherkey = B64.decode(record.cipherkey.as_bytes()).map_err(|_| RelayError::InvalidInput)?;
    let iv_or_nonce = B64.decode(record.iv.as_bytes()).map_err(|_| RelayError::InvalidInput)?;
    let ciphertext = B64.decode(record.ciphertext.as_bytes()).map_err(|_| RelayError::InvalidInput)?;

    let key_b64 = own_private_key
        .decrypt(Oaep::new::<Sha256>(), &cipherkey)
        .map_err(|_| RelayError::InvalidInput)?;
    let aes_key = B64.decode(&key_b64).map_err(|_| RelayError::InvalidInput)?;
    if aes_key.len() != AES_KEY_LEN {
        return Err(RelayError::InvalidInput);
    }

    if record.aead {
        if iv_or_nonce.len() != GCM_NONCE_LEN {
            return Err(RelayError::InvalidInput);
        }
        let cipher = Aes256Gcm::new_from_slice(&aes_key).map_err(|_| RelayError::Internal)?;
        let nonce = GcmNonce::from_slice(&iv_or_nonce);
        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| RelayError::InvalidInput)
    } else {
        if iv_or_nonce.len() != IV_LEN {
            return Err(RelayError::InvalidInput);
        }
        Aes256CbcDec::new(aes_key.as_slice().into(), iv_or_nonce.as_slice().into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| RelayError::InvalidInput)
    }
}

fn classify(bytes: Vec<u8>) -> Decrypted {
    match String::from_utf8(bytes) {
        Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => Decrypted::Json(value),
            Err(_) => Decrypted::Text(text),
        },
        Err(err) => Decrypted::Bytes(err.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let priv_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate key");
        let pub_key = RsaPublicKey::from(&priv_key);
        (priv_key, pub_key)
    }

    #[test]
    fn round_trip_bytes() {
        let (priv_key, pub_key) = test_keypair();
        let record = encrypt(Plaintext::Bytes(vec![1, 2, 3, 255]), &pub_key).unwrap();
        match decrypt(&record, &priv_key).unwrap() {
            Decrypted::Bytes(b) => assert_eq!(b, vec![1, 2, 3, 255]),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_text() {
        let (priv_key, pub_key) = test_keypair();
        let record = encrypt(Plaintext::Text("hello world".into()), &pub_key).unwrap();
        match decrypt(&record, &priv_key).unwrap() {
            Decrypted::Text(s) => assert_eq!(s, "hello world"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_json() {
        let (priv_key, pub_key) = test_keypair();
        let value = serde_json::json!({"role": "user", "content": "ping"});
        let record = encrypt(Plaintext::Json(value.clone()), &pub_key).unwrap();
        match decrypt(&record, &priv_key).unwrap() {
            Decrypted::Json(v) => assert_eq!(v, value),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_authenticated() {
        let (priv_key, pub_key) = test_keypair();
        let record = encrypt_authenticated(Plaintext::Text("secure".into()), &pub_key).unwrap();
        assert!(record.aead);
        match decrypt(&record, &priv_key).unwrap() {
            Decrypted::Text(s) => assert_eq!(s, "secure"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn encrypt_twice_differs() {
        let (_priv_key, pub_key) = test_keypair();
        let a = encrypt(Plaintext::Text("same".into()), &pub_key).unwrap();
        let b = encrypt(Plaintext::Text("same".into()), &pub_key).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.cipherkey, b.cipherkey);
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn tamper_ciphertext_fails() {
        let (priv_key, pub_key) = test_keypair();
        let mut record = encrypt(Plaintext::Text("hello".into()), &pub_key).unwrap();
        let mut raw = B64.decode(&record.ciphertext).unwrap();
        raw[0] ^= 0xFF;
        record.ciphertext = B64.encode(raw);
        assert!(decrypt(&record, &priv_key).is_err());
    }

    #[test]
    fn tamper_cipherkey_fails() {
        let (priv_key, pub_key) = test_keypair();
        let mut record = encrypt(Plaintext::Text("hello".into()), &pub_key).unwrap();
        let mut raw = B64.decode(&record.cipherkey).unwrap();
        raw[0] ^= 0xFF;
        record.cipherkey = B64.encode(raw);
        assert!(decrypt(&record, &priv_key).is_err());
    }

    #[test]
    fn missing_field_is_reported() {
        let record = EnvelopeRecord {
            ciphertext: "".into(),
            ..Default::default()
        };
        let (priv_key, _pub_key) = test_keypair();
        match decrypt(&record, &priv_key) {
            Err(RelayError::MissingField("ciphertext")) => {}
            other => panic!("expected missing-field(ciphertext), got {other:?}"),
        }
    }

    #[test]
    fn final_field_round_trips_through_json_as_final() {
        let record = EnvelopeRecord {
            ciphertext: "x".into(),
            cipherkey: "y".into(),
            iv: "z".into(),
            final_chunk: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["final"], serde_json::json!(true));
        assert!(json.get("final_chunk").is_none());
    }
}
