//! Hybrid cryptographic envelope (C1) and key manager (C2).

pub mod envelope;
pub mod iv_guard;
pub mod keys;
pub mod stream;

pub use envelope::{decrypt, decrypt_to_bytes, encrypt, encrypt_authenticated, Decrypted, EnvelopeRecord, Plaintext};
pub use iv_guard::IvGuard;
pub use keys::{decode_public_key, encode_public_key, fingerprint, KeyManager};
pub use stream::{begin_stream, decrypt_stream_chunk, encrypt_stream_chunk, open_stream, StreamSession};
