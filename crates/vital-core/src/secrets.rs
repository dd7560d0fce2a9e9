//! API-key sealing with AES-256-GCM.
//!
//! Keys are stored as `base64(nonce || ciphertext)` in the settings row. An
//! empty master key disables sealing entirely (dev mode): values pass through
//! verbatim in both directions.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, VitalError};

pub struct KeySealer {
    key: Option<LessSafeKey>,
    rng: SystemRandom,
}

impl KeySealer {
    /// Build from the config's base64 master key. Empty string = passthrough.
    pub fn from_master_key_b64(master_key_b64: &str) -> Result<Self> {
        let trimmed = master_key_b64.trim();
        if trimmed.is_empty() {
            return Ok(Self {
                key: None,
                rng: SystemRandom::new(),
            });
        }
        let raw = B64
            .decode(trimmed)
            .map_err(|e| VitalError::Encryption(format!("bad master key encoding: {e}")))?;
        let unbound = UnboundKey::new(&AES_256_GCM, &raw)
            .map_err(|_| VitalError::Encryption("master key must be 32 bytes".to_string()))?;
        Ok(Self {
            key: Some(LessSafeKey::new(unbound)),
            rng: SystemRandom::new(),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| VitalError::Encryption("nonce generation failed".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| VitalError::Encryption("seal failed".to_string()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&buf);
        Ok(B64.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let Some(key) = &self.key else {
            return Ok(sealed.to_string());
        };
        let raw = B64
            .decode(sealed.trim())
            .map_err(|e| VitalError::Encryption(format!("bad sealed value: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(VitalError::Encryption("sealed value too short".to_string()));
        }
        let (nonce_bytes, cipher) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| VitalError::Encryption("bad nonce".to_string()))?;
        let mut buf = cipher.to_vec();
        let plain = key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| VitalError::Encryption("open failed".to_string()))?;
        String::from_utf8(plain.to_vec())
            .map_err(|_| VitalError::Encryption("sealed value is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_without_master_key() {
        let sealer = KeySealer::from_master_key_b64("").unwrap();
        assert_eq!(sealer.seal("sk-test").unwrap(), "sk-test");
        assert_eq!(sealer.open("sk-test").unwrap(), "sk-test");
    }

    #[test]
    fn seal_open_round_trip() {
        let key = B64.encode([7u8; 32]);
        let sealer = KeySealer::from_master_key_b64(&key).unwrap();
        let sealed = sealer.seal("sk-ant-secret").unwrap();
        assert_ne!(sealed, "sk-ant-secret");
        assert_eq!(sealer.open(&sealed).unwrap(), "sk-ant-secret");
    }

    #[test]
    fn rejects_short_master_key() {
        let key = B64.encode([1u8; 16]);
        assert!(KeySealer::from_master_key_b64(&key).is_err());
    }
}
