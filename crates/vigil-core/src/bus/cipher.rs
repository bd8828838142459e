//! Pre-shared-key sealing for bus traffic: AES-256-GCM, `[12-byte nonce][ciphertext]`,
//! base64 for text tokens.

use crate::error::{VigilError, VigilResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric cipher shared by every agent on the bus.
#[derive(Clone)]
pub struct BusCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for BusCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BusCipher(..)")
    }
}

impl BusCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> VigilResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| VigilError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Key from 64 hex characters.
    pub fn from_hex(hex_key: &str) -> VigilResult<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| VigilError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| VigilError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len())))?;
        Self::new(&key)
    }

    pub fn seal_bytes(&self, plain: &[u8]) -> VigilResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|e| VigilError::Crypto(format!("encrypt: {}", e)))?;
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open_bytes(&self, sealed: &[u8]) -> VigilResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(VigilError::Crypto("sealed blob shorter than nonce".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| VigilError::Crypto(format!("decrypt: {}", e)))
    }

    /// Seal and base64-encode.
    pub fn seal(&self, plain: &[u8]) -> VigilResult<String> {
        Ok(STANDARD.encode(self.seal_bytes(plain)?))
    }

    pub fn open(&self, token: &str) -> VigilResult<Vec<u8>> {
        let sealed = STANDARD
            .decode(token.trim())
            .map_err(|e| VigilError::Crypto(format!("base64: {}", e)))?;
        self.open_bytes(&sealed)
    }
}
