//! Encryption strategy seam for configuration blobs at rest.
//!
//! The metadata store persists resource config sources and check plans
//! through this interface. The store never interprets ciphertext or nonce;
//! a `None` nonce marks plaintext written by [`NoEncryption`], which lets a
//! deployment turn encryption on later and re-encrypt lazily.

/// Encrypts and decrypts opaque blobs.
pub trait EncryptionStrategy: Send + Sync {
    /// Encrypt a plaintext blob, returning ciphertext and an optional nonce.
    fn encrypt(&self, plaintext: &[u8]) -> crate::Result<(Vec<u8>, Option<String>)>;

    /// Decrypt a ciphertext blob produced by this strategy.
    fn decrypt(&self, ciphertext: &[u8], nonce: Option<&str>) -> crate::Result<Vec<u8>>;
}

/// Pass-through strategy: stores blobs unencrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl EncryptionStrategy for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> crate::Result<(Vec<u8>, Option<String>)> {
        Ok((plaintext.to_vec(), None))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: Option<&str>) -> crate::Result<Vec<u8>> {
        if nonce.is_some() {
            return Err(crate::Error::Encryption(
                "blob was written with encryption enabled but no key is configured".to_string(),
            ));
        }
        Ok(ciphertext.to_vec())
    }
}
