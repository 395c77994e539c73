//! Key manager (C2): generates the relay's own RSA keypair, validates and
//! fingerprints peer public keys, and rotates keys with a decrypt-only
//! grace window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::policy::errors::RelayError;

const RSA_BITS: usize = 2048;
const RSA_EXPONENT: u64 = 65537;

/// Stable short identifier for a public key (§3, §4.3): SHA-256 of the SPKI
/// DER, hex-encoded, truncated to the first 16 bytes (32 hex chars). Shared
/// between worker identity and rate-limit keys, so this is the one routine
/// both call.
pub fn fingerprint(public_key: &RsaPublicKey) -> Result<String, RelayError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|_| RelayError::Internal)?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(hex::encode(&digest[..16]))
}

/// Strips whitespace, base64-decodes, and parses `raw` as an SPKI-DER RSA
/// public key, rejecting anything under 2048 bits or with a non-standard
/// exponent (§4.2).
pub fn decode_public_key(raw: &str) -> Result<RsaPublicKey, RelayError> {
    let trimmed: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidInput);
    }
    let der = B64.decode(trimmed.as_bytes()).map_err(|_| RelayError::InvalidInput)?;
    let key = RsaPublicKey::from_public_key_der(&der).map_err(|_| RelayError::InvalidInput)?;
    if key.n().bits() < RSA_BITS {
        return Err(RelayError::InvalidInput);
    }
    if key.e() != &rsa::BigUint::from(RSA_EXPONENT) {
        return Err(RelayError::InvalidInput);
    }
    Ok(key)
}

/// Base64-SPKI encoding of `key`, as handed to clients/workers on the wire.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String, RelayError> {
    let der = key.to_public_key_der().map_err(|_| RelayError::Internal)?;
    Ok(B64.encode(der.as_bytes()))
}

struct RotatingKeypair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    retired_at: Option<Instant>,
}

/// Holds the relay's active keypair plus a small ring of recently-retired
/// private keys kept around only to let in-flight requests finish
/// decrypting during the rotation grace window (§4.2, §9).
pub struct KeyManager {
    current: RwLock<RotatingKeypair>,
    retired: RwLock<VecDeque<RotatingKeypair>>,
    grace_window: Duration,
}

impl KeyManager {
    pub fn generate(grace_window: Duration) -> Result<Self, RelayError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|_| RelayError::Internal)?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            current: RwLock::new(RotatingKeypair {
                private_key,
                public_key,
                retired_at: None,
            }),
            retired: RwLock::new(VecDeque::new()),
            grace_window,
        })
    }

    pub async fn own_public_key(&self) -> RsaPublicKey {
        self.current.read().await.public_key.clone()
    }

    pub async fn own_public_key_b64(&self) -> Result<String, RelayError> {
        encode_public_key(&self.own_public_key().await)
    }

    /// Atomically replaces the active keypair with a fresh one, pushing the
    /// previous private key onto the retired ring for decrypt-only use
    /// during the grace window.
    pub async fn rotate(&self) -> Result<(), RelayError> {
        let new_private = RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|_| RelayError::Internal)?;
        let new_public = RsaPublicKey::from(&new_private);

        let mut current = self.current.write().await;
        let retiring = std::mem::replace(
            &mut *current,
            RotatingKeypair {
                private_key: new_private,
                public_key: new_public,
                retired_at: None,
            },
        );
        drop(current);

        let mut retiring = retiring;
        retiring.retired_at = Some(Instant::now());
        let mut retired = self.retired.write().await;
        retired.push_back(retiring);
        self.prune_expired(&mut retired);
        Ok(())
    }

    fn prune_expired(&self, retired: &mut VecDeque<RotatingKeypair>) {
        let grace = self.grace_window;
        retired.retain(|k| k.retired_at.is_some_and(|t| t.elapsed() < grace));
    }

    /// Tries the active private key first, then falls back through the
    /// retired ring (oldest discarded once past the grace window). Used by
    /// decrypt paths so an in-flight request started just before a rotation
    /// still completes.
    pub async fn try_decrypt<F, T>(&self, attempt: F) -> Result<T, RelayError>
    where
        F: Fn(&RsaPrivateKey) -> Result<T, RelayError>,
    {
        {
            let current = self.current.read().await;
            if let Ok(v) = attempt(&current.private_key) {
                return Ok(v);
            }
        }
        let mut retired = self.retired.write().await;
        self.prune_expired(&mut retired);
        for candidate in retired.iter() {
            if let Ok(v) = attempt(&candidate.private_key) {
                return Ok(v);
            }
        }
        Err(RelayError::InvalidInput)
    }
}
