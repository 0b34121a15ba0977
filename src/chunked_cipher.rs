//! Chunked RSA transport encryption and the AES helpers used by the client
//! key cache.
//!
//! RSA can only take one block of plaintext per operation, so longer values
//! are split into sequential chunks, each encrypted on its own. Chunks carry
//! no length or count metadata: reassembly is plain concatenation in index
//! order.

use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::rsa::Padding;
use openssl::symm::Cipher;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{CryptoError, CryptoResult};
use crate::field::EncryptedField;

/// Plaintext bytes per chunk used by deployed clients.
pub const DEFAULT_CHUNK_SIZE: usize = 80;
/// PKCS#1 v1.5 padding overhead in bytes
pub const PKCS1_OVERHEAD: usize = 11;
/// OAEP (SHA-1) padding overhead in bytes
pub const OAEP_OVERHEAD: usize = 42;
/// PBKDF2 rounds for the cache wrapping key
pub const AES_KDF_ITERATIONS: usize = 10_000;

/// How many plaintext bytes go into one RSA block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ChunkSizeRepr")]
pub enum ChunkSize {
    /// A fixed byte count, rejected if it exceeds the key's capacity.
    Fixed(usize),
    /// Whatever the key's modulus and padding allow.
    KeyCapacity,
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Fixed(DEFAULT_CHUNK_SIZE)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChunkSizeRepr {
    Bytes(usize),
    Policy(String),
}

impl TryFrom<ChunkSizeRepr> for ChunkSize {
    type Error = String;

    fn try_from(repr: ChunkSizeRepr) -> Result<Self, Self::Error> {
        match repr {
            ChunkSizeRepr::Bytes(n) => Ok(ChunkSize::Fixed(n)),
            ChunkSizeRepr::Policy(p) if p == "key-capacity" => Ok(ChunkSize::KeyCapacity),
            ChunkSizeRepr::Policy(p) => Err(format!("unknown chunk size policy: {}", p)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RsaPadding {
    #[default]
    Pkcs1,
    Oaep,
}

impl RsaPadding {
    fn openssl(self) -> Padding {
        match self {
            RsaPadding::Pkcs1 => Padding::PKCS1,
            RsaPadding::Oaep => Padding::PKCS1_OAEP,
        }
    }

    fn overhead(self) -> usize {
        match self {
            RsaPadding::Pkcs1 => PKCS1_OVERHEAD,
            RsaPadding::Oaep => OAEP_OVERHEAD,
        }
    }
}

/// Plaintext recovered from an [`EncryptedField`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlainField {
    Value(Vec<u8>),
    Nested(BTreeMap<String, PlainField>),
}

impl PlainField {
    /// The value as UTF-8 text, if this is a leaf.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PlainField::Value(bytes) => std::str::from_utf8(bytes).ok(),
            PlainField::Nested(_) => None,
        }
    }

    /// JSON view; non-UTF-8 leaves are rendered lossily.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PlainField::Value(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            PlainField::Nested(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedCipher {
    chunk_size: ChunkSize,
    padding: RsaPadding,
}

impl ChunkedCipher {
    pub fn new(chunk_size: ChunkSize, padding: RsaPadding) -> Self {
        Self {
            chunk_size,
            padding,
        }
    }

    /// Maximum plaintext bytes one block of `key` can carry under this padding.
    pub fn block_capacity<T: HasPublic>(&self, key: &PKeyRef<T>) -> CryptoResult<usize> {
        let rsa = key
            .rsa()
            .map_err(|e| CryptoError::InvalidKey(format!("not an RSA key: {}", e)))?;
        Ok((rsa.size() as usize).saturating_sub(self.padding.overhead()))
    }

    /// Effective chunk size for `key`.
    pub fn chunk_size_for<T: HasPublic>(&self, key: &PKeyRef<T>) -> CryptoResult<usize> {
        let capacity = self.block_capacity(key)?;
        match self.chunk_size {
            ChunkSize::KeyCapacity if capacity > 0 => Ok(capacity),
            ChunkSize::KeyCapacity => Err(CryptoError::ChunkTooLarge {
                chunk_size: 1,
                capacity,
            }),
            ChunkSize::Fixed(chunk_size) if chunk_size == 0 || chunk_size > capacity => {
                Err(CryptoError::ChunkTooLarge {
                    chunk_size,
                    capacity,
                })
            }
            ChunkSize::Fixed(chunk_size) => Ok(chunk_size),
        }
    }

    /// Encrypt `plaintext` for transport, chunking when it exceeds one block.
    pub fn encrypt_for_transport(
        &self,
        plaintext: &[u8],
        public_key: &PKeyRef<Public>,
    ) -> CryptoResult<EncryptedField> {
        let chunk_size = self.chunk_size_for(public_key)?;
        if plaintext.len() <= chunk_size {
            return Ok(EncryptedField::Scalar(self.encrypt_block(plaintext, public_key)?));
        }
        let chunks = plaintext
            .chunks(chunk_size)
            .map(|chunk| self.encrypt_block(chunk, public_key))
            .collect::<CryptoResult<Vec<_>>>()?;
        Ok(EncryptedField::Chunked(chunks))
    }

    /// Decrypt a scalar or chunked field and concatenate in order.
    pub fn decrypt_from_transport(
        &self,
        field: &EncryptedField,
        private_key: &PKeyRef<Private>,
    ) -> CryptoResult<Vec<u8>> {
        match field {
            EncryptedField::Scalar(block) => self.decrypt_block(block, private_key),
            EncryptedField::Chunked(chunks) => {
                let mut plaintext = Vec::new();
                for block in chunks {
                    plaintext.extend_from_slice(&self.decrypt_block(block, private_key)?);
                }
                Ok(plaintext)
            }
            EncryptedField::Nested(_) => Err(CryptoError::MalformedField(
                "nested field has no single plaintext".to_string(),
            )),
        }
    }

    /// Recursive decrypt over any field shape.
    pub fn open(
        &self,
        field: &EncryptedField,
        private_key: &PKeyRef<Private>,
    ) -> CryptoResult<PlainField> {
        match field {
            EncryptedField::Nested(map) => {
                let mut opened = BTreeMap::new();
                for (key, inner) in map {
                    opened.insert(key.clone(), self.open(inner, private_key)?);
                }
                Ok(PlainField::Nested(opened))
            }
            leaf => Ok(PlainField::Value(
                self.decrypt_from_transport(leaf, private_key)?,
            )),
        }
    }

    fn encrypt_block(&self, block: &[u8], public_key: &PKeyRef<Public>) -> CryptoResult<Vec<u8>> {
        let rsa = public_key
            .rsa()
            .map_err(|e| CryptoError::InvalidKey(format!("not an RSA key: {}", e)))?;
        let mut ciphertext = vec![0u8; rsa.size() as usize];
        let len = rsa
            .public_encrypt(block, &mut ciphertext, self.padding.openssl())
            .map_err(|e| CryptoError::Rsa(format!("encryption failed: {}", e)))?;
        ciphertext.truncate(len);
        Ok(ciphertext)
    }

    fn decrypt_block(&self, block: &[u8], private_key: &PKeyRef<Private>) -> CryptoResult<Vec<u8>> {
        let rsa = private_key
            .rsa()
            .map_err(|e| CryptoError::InvalidKey(format!("not an RSA key: {}", e)))?;
        let mut plaintext = vec![0u8; rsa.size() as usize];
        let len = rsa
            .private_decrypt(block, &mut plaintext, self.padding.openssl())
            .map_err(|_| CryptoError::Rsa("decryption failed".to_string()))?;
        plaintext.truncate(len);
        Ok(plaintext)
    }
}

/// Parse a PEM public key as returned by the key endpoint.
pub fn public_key_from_pem(pem: &str) -> CryptoResult<PKey<Public>> {
    PKey::public_key_from_pem(pem.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("bad public key PEM: {}", e)))
}

/// Symmetric ciphers accepted by [`aes_encrypt`] / [`aes_decrypt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymmetricCipher {
    Aes128Cbc,
    Aes192Cbc,
    #[default]
    Aes256Cbc,
}

impl SymmetricCipher {
    pub fn parse(name: &str) -> CryptoResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-cbc" => Ok(SymmetricCipher::Aes128Cbc),
            "aes-192-cbc" => Ok(SymmetricCipher::Aes192Cbc),
            "aes-256-cbc" => Ok(SymmetricCipher::Aes256Cbc),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn openssl(self) -> Cipher {
        match self {
            SymmetricCipher::Aes128Cbc => Cipher::aes_128_cbc(),
            SymmetricCipher::Aes192Cbc => Cipher::aes_192_cbc(),
            SymmetricCipher::Aes256Cbc => Cipher::aes_256_cbc(),
        }
    }
}

/// Derive key and IV from a password, using `salt` as PBKDF2 salt.
fn derive_key_iv(cipher: Cipher, password: &str, salt: &str) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
    let key_len = cipher.key_len();
    let iv_len = cipher.iv_len().unwrap_or(0);
    let mut material = vec![0u8; key_len + iv_len];
    openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        salt.as_bytes(),
        AES_KDF_ITERATIONS,
        MessageDigest::sha256(),
        &mut material,
    )
    .map_err(|e| CryptoError::Aes(format!("key derivation failed: {}", e)))?;
    let iv = material.split_off(key_len);
    Ok((material, iv))
}

/// Password-based AES encryption, base64 output.
pub fn aes_encrypt(
    data: &[u8],
    password: &str,
    iv: &str,
    cipher: SymmetricCipher,
) -> CryptoResult<String> {
    use base64::Engine;
    let cipher = cipher.openssl();
    let (key, iv) = derive_key_iv(cipher, password, iv)?;
    let ciphertext = openssl::symm::encrypt(cipher, &key, Some(&iv), data)
        .map_err(|e| CryptoError::Aes(format!("encryption failed: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
}

/// Inverse of [`aes_encrypt`]. A wrong password or IV fails or yields garbage.
pub fn aes_decrypt(
    data: &str,
    password: &str,
    iv: &str,
    cipher: SymmetricCipher,
) -> CryptoResult<Vec<u8>> {
    use base64::Engine;
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|_| CryptoError::Aes("ciphertext is not base64".to_string()))?;
    let cipher = cipher.openssl();
    let (key, iv) = derive_key_iv(cipher, password, iv)?;
    openssl::symm::decrypt(cipher, &key, Some(&iv), &ciphertext)
        .map_err(|_| CryptoError::Aes("decryption failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;

    fn keypair(bits: u32) -> (PKey<Private>, PKey<Public>) {
        let rsa = Rsa::generate(bits).unwrap();
        let private_key = PKey::from_rsa(rsa).unwrap();
        let pem = private_key.public_key_to_pem().unwrap();
        let public_key = PKey::public_key_from_pem(&pem).unwrap();
        (private_key, public_key)
    }

    #[test]
    fn test_short_plaintext_is_single_chunk() {
        let (private_key, public_key) = keypair(1024);
        let cipher = ChunkedCipher::default();
        let full = "x".repeat(DEFAULT_CHUNK_SIZE);
        for text in ["", "a", "name=John", full.as_str()] {
            let field = cipher.encrypt_for_transport(text.as_bytes(), &public_key).unwrap();
            assert!(matches!(field, EncryptedField::Scalar(_)));
            let plain = cipher.decrypt_from_transport(&field, &private_key).unwrap();
            assert_eq!(plain, text.as_bytes());
        }
    }

    #[test]
    fn test_long_plaintext_chunk_count_and_order() {
        let (private_key, public_key) = keypair(1024);
        let cipher = ChunkedCipher::default();
        let text: String = (0..250).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let field = cipher.encrypt_for_transport(text.as_bytes(), &public_key).unwrap();
        let EncryptedField::Chunked(chunks) = &field else {
            panic!("expected chunked field");
        };
        assert_eq!(chunks.len(), 4); // ceil(250 / 80)
        let plain = cipher.decrypt_from_transport(&field, &private_key).unwrap();
        assert_eq!(plain, text.as_bytes());
    }

    #[test]
    fn test_each_chunk_carries_raw_plaintext_bytes() {
        let (private_key, public_key) = keypair(1024);
        let cipher = ChunkedCipher::default();
        let data: Vec<u8> = (0..160u32).map(|i| (i * 7 % 256) as u8).collect();
        let EncryptedField::Chunked(chunks) =
            cipher.encrypt_for_transport(&data, &public_key).unwrap()
        else {
            panic!("expected chunked field");
        };
        // 160 raw bytes are two chunks; a base64 body would need three
        assert_eq!(chunks.len(), 2);
        let first = cipher
            .decrypt_from_transport(&EncryptedField::Scalar(chunks[0].clone()), &private_key)
            .unwrap();
        assert_eq!(first, &data[..80]);
    }

    #[test]
    fn test_reordered_chunks_corrupt_silently() {
        let (private_key, public_key) = keypair(1024);
        let cipher = ChunkedCipher::default();
        let text = format!("{}{}", "A".repeat(80), "B".repeat(80));
        let EncryptedField::Chunked(mut chunks) =
            cipher.encrypt_for_transport(text.as_bytes(), &public_key).unwrap()
        else {
            panic!("expected chunked field");
        };
        chunks.swap(0, 1);
        let plain = cipher
            .decrypt_from_transport(&EncryptedField::Chunked(chunks), &private_key)
            .unwrap();
        assert_ne!(plain, text.as_bytes());
        assert_eq!(plain.len(), text.len());
    }

    #[test]
    fn test_fixed_chunk_larger_than_block_rejected() {
        let (_, public_key) = keypair(1024);
        let cipher = ChunkedCipher::new(ChunkSize::Fixed(200), RsaPadding::Pkcs1);
        let err = cipher.encrypt_for_transport(b"hi", &public_key).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::ChunkTooLarge {
                chunk_size: 200,
                capacity: 117
            }
        ));
    }

    #[test]
    fn test_key_capacity_policy_uses_modulus() {
        let (private_key, public_key) = keypair(1024);
        let cipher = ChunkedCipher::new(ChunkSize::KeyCapacity, RsaPadding::Oaep);
        assert_eq!(cipher.chunk_size_for(&public_key).unwrap(), 128 - OAEP_OVERHEAD);
        let text = vec![7u8; 200];
        let field = cipher.encrypt_for_transport(&text, &public_key).unwrap();
        assert_eq!(field.block_count(), 3);
        assert_eq!(cipher.decrypt_from_transport(&field, &private_key).unwrap(), text);
    }

    #[test]
    fn test_open_nested() {
        let (private_key, public_key) = keypair(1024);
        let cipher = ChunkedCipher::default();
        let mut map = BTreeMap::new();
        map.insert(
            "street".to_string(),
            cipher.encrypt_for_transport(b"Main St", &public_key).unwrap(),
        );
        let opened = cipher.open(&EncryptedField::Nested(map), &private_key).unwrap();
        assert_eq!(opened.to_json(), serde_json::json!({ "street": "Main St" }));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_, public_key) = keypair(1024);
        let (other_private, _) = keypair(1024);
        let cipher = ChunkedCipher::default();
        let field = cipher.encrypt_for_transport(b"secret", &public_key).unwrap();
        // implicit rejection may hand back random bytes instead of an error
        let opened = cipher.decrypt_from_transport(&field, &other_private);
        assert!(opened.map(|p| p != b"secret").unwrap_or(true));
    }

    #[test]
    fn test_aes_wrap_roundtrip_and_wrong_password() {
        let wrapped = aes_encrypt(
            b"-----BEGIN PUBLIC KEY-----",
            "3f1c2d4e-uuid",
            "a1b2c3d4e5f6a7b8",
            SymmetricCipher::Aes256Cbc,
        )
        .unwrap();
        let unwrapped = aes_decrypt(
            &wrapped,
            "3f1c2d4e-uuid",
            "a1b2c3d4e5f6a7b8",
            SymmetricCipher::Aes256Cbc,
        )
        .unwrap();
        assert_eq!(unwrapped, b"-----BEGIN PUBLIC KEY-----");

        let wrong = aes_decrypt(
            &wrapped,
            "another-uuid",
            "a1b2c3d4e5f6a7b8",
            SymmetricCipher::Aes256Cbc,
        );
        assert!(wrong.map(|w| w != b"-----BEGIN PUBLIC KEY-----").unwrap_or(true));
    }

    #[test]
    fn test_symmetric_cipher_names() {
        assert_eq!(SymmetricCipher::parse("AES-256-CBC").unwrap(), SymmetricCipher::Aes256Cbc);
        assert!(SymmetricCipher::parse("des-ede3").is_err());
    }
}
