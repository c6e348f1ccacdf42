//! RSA key material
//!
//! Every node owns an RSA 2048-bit keypair, persisted base64-DER under the
//! `myself` configuration namespace. Pairing exchanges the public halves;
//! message bodies are then encrypted block-by-block with PKCS#1 v1.5
//! padding, so a plaintext longer than one block becomes a sequence of
//! ciphertext blocks.

use crate::config::{ConfigHandle, MYSELF_NS};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use openssl::pkey::{Private, Public};
use openssl::rsa::{Padding, Rsa};
use tracing::info;

/// RSA modulus size in bits
const RSA_BITS: u32 = 2048;

/// PKCS#1 v1.5 padding overhead per block, in bytes
const PKCS1_OVERHEAD: usize = 11;

/// The local identity keypair
pub struct LocalKeyPair {
    rsa: Rsa<Private>,
}

impl LocalKeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(RSA_BITS)?;
        Ok(Self { rsa })
    }

    /// Load the persisted keypair from the `myself` namespace
    ///
    /// Fails with [`Error::Configuration`] when no private key is stored.
    pub fn load(config: &ConfigHandle) -> Result<Self> {
        let encoded = config
            .read(MYSELF_NS, "privateKey")
            .ok_or_else(|| Error::Configuration("no private key stored".to_string()))?;
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Configuration(format!("stored private key is not base64: {e}")))?;
        let rsa = Rsa::private_key_from_der(&der)?;
        Ok(Self { rsa })
    }

    /// Load the persisted keypair, generating and persisting one on first use
    pub fn load_or_generate(config: &ConfigHandle) -> Result<Self> {
        if config.read(MYSELF_NS, "privateKey").is_some() {
            return Self::load(config);
        }

        info!("generating identity keypair");
        let pair = Self::generate()?;
        config.write(
            MYSELF_NS,
            "privateKey",
            &BASE64.encode(pair.rsa.private_key_to_der()?),
        );
        config.write(MYSELF_NS, "publicKey", &pair.public_key_base64()?);
        Ok(pair)
    }

    /// Base64 of the DER-encoded public half
    pub fn public_key_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.rsa.public_key_to_der()?))
    }

    /// Decrypt a sequence of base64 ciphertext blocks and concatenate the
    /// plaintext
    pub fn decrypt_blocks(&self, blocks: &[String]) -> Result<Vec<u8>> {
        let mut plaintext = Vec::new();
        let mut buf = vec![0u8; self.rsa.size() as usize];
        for block in blocks {
            let ciphertext = BASE64.decode(block.trim()).map_err(|e| {
                Error::MalformedPacket(format!("ciphertext block is not base64: {e}"))
            })?;
            let n = self
                .rsa
                .private_decrypt(&ciphertext, &mut buf, Padding::PKCS1)?;
            plaintext.extend_from_slice(&buf[..n]);
        }
        Ok(plaintext)
    }
}

/// A peer's public key, as received during pairing
pub struct PeerPublicKey {
    rsa: Rsa<Public>,
    der: Vec<u8>,
}

impl PeerPublicKey {
    /// Parse a base64 DER public key
    pub fn from_base64_der(encoded: &str) -> Result<Self> {
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::MalformedPacket(format!("public key is not base64: {e}")))?;
        let rsa = Rsa::public_key_from_der(&der)?;
        Ok(Self { rsa, der })
    }

    /// Base64 of the DER encoding, as persisted and sent on the wire
    pub fn to_base64_der(&self) -> String {
        BASE64.encode(&self.der)
    }

    /// Encrypt a plaintext into base64 ciphertext blocks
    ///
    /// The plaintext is split into chunks that fit a single RSA block under
    /// PKCS#1 v1.5 padding.
    pub fn encrypt_blocks(&self, plaintext: &[u8]) -> Result<Vec<String>> {
        let block_size = self.rsa.size() as usize;
        let chunk_size = block_size - PKCS1_OVERHEAD;
        let mut blocks = Vec::with_capacity(plaintext.len() / chunk_size + 1);
        let mut buf = vec![0u8; block_size];
        for chunk in plaintext.chunks(chunk_size) {
            let n = self.rsa.public_encrypt(chunk, &mut buf, Padding::PKCS1)?;
            blocks.push(BASE64.encode(&buf[..n]));
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let local = LocalKeyPair::generate().unwrap();
        let peer = PeerPublicKey::from_base64_der(&local.public_key_base64().unwrap()).unwrap();

        let plaintext = b"a short message";
        let blocks = peer.encrypt_blocks(plaintext).unwrap();
        assert_eq!(blocks.len(), 1);

        let decrypted = local.decrypt_blocks(&blocks).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_multi_block_roundtrip() {
        let local = LocalKeyPair::generate().unwrap();
        let peer = PeerPublicKey::from_base64_der(&local.public_key_base64().unwrap()).unwrap();

        let plaintext = vec![0x5au8; 1000];
        let blocks = peer.encrypt_blocks(&plaintext).unwrap();
        assert!(blocks.len() > 1);

        let decrypted = local.decrypt_blocks(&blocks).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_public_key_encoding_roundtrip() {
        let local = LocalKeyPair::generate().unwrap();
        let encoded = local.public_key_base64().unwrap();
        let peer = PeerPublicKey::from_base64_der(&encoded).unwrap();
        assert_eq!(peer.to_base64_der(), encoded);
    }

    #[test]
    fn test_rejects_bad_key_material() {
        assert!(PeerPublicKey::from_base64_der("not base64 at all!!!").is_err());
        // Valid base64 that is not a DER public key
        assert!(PeerPublicKey::from_base64_der("aGVsbG8gd29ybGQ=").is_err());
    }

    #[test]
    fn test_decrypt_rejects_bad_blocks() {
        let local = LocalKeyPair::generate().unwrap();
        assert!(matches!(
            local.decrypt_blocks(&["///not-base64".to_string()]),
            Err(Error::MalformedPacket(_))
        ));
        assert!(local.decrypt_blocks(&["aGVsbG8=".to_string()]).is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let config = ConfigHandle::new(MemoryConfig::default());

        let first = LocalKeyPair::load_or_generate(&config).unwrap();
        assert!(config.read(MYSELF_NS, "privateKey").is_some());
        assert_eq!(
            config.read(MYSELF_NS, "publicKey").unwrap(),
            first.public_key_base64().unwrap()
        );

        // A second load yields the same key
        let second = LocalKeyPair::load_or_generate(&config).unwrap();
        assert_eq!(
            first.public_key_base64().unwrap(),
            second.public_key_base64().unwrap()
        );
    }

    #[test]
    fn test_load_without_key_fails() {
        let config = ConfigHandle::new(MemoryConfig::default());
        assert!(matches!(
            LocalKeyPair::load(&config),
            Err(Error::Configuration(_))
        ));
    }
}
