//! Cipher primitives used by the handshake and the connections.
//!
//! RSA (PKCS#1 v1.5) only carries the session key; message bodies use
//! AES-CBC with PKCS#7 padding. The IV is the first block of the key itself
//! and the key is drawn from a 36-character alphabet, so the symmetric layer
//! is deliberately weaker than full-entropy AES.

use std::fmt;

use aes::cipher::{
    block_padding::Pkcs7, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use rand::rngs::OsRng;
use rand::Rng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::types::{CryptoTcpError, Result};

/// Characters a session key is drawn from.
pub const SESSION_KEY_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

const AES_BLOCK_SIZE: usize = 16;

/// An RSA keypair owned by one end of a connection.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair. This is CPU heavy; call it off the async
    /// executor (`spawn_blocking`).
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// PKCS#1 DER encoding of the public half.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        encode_public_key(&self.public)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.private.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoTcpError::Crypto(e.to_string()))
}

pub fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|e| CryptoTcpError::Crypto(e.to_string()))
}

/// Encrypt `data` for the holder of `key`.
pub fn rsa_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    Ok(key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)?)
}

/// Symmetric key negotiated during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Draw `len` characters from [`SESSION_KEY_ALPHABET`] using the OS RNG.
    pub fn generate(len: usize) -> Self {
        let mut rng = OsRng;
        let key = (0..len)
            .map(|_| SESSION_KEY_ALPHABET[rng.gen_range(0..SESSION_KEY_ALPHABET.len())])
            .collect();
        Self(key)
    }

    /// Wrap received key bytes; the length must select an AES variant.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if !matches!(bytes.len(), 16 | 24 | 32) {
            return Err(CryptoTcpError::Crypto(format!(
                "invalid session key length {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.0.len() {
            16 => cbc_encrypt::<aes::Aes128>(&self.0, plaintext),
            24 => cbc_encrypt::<aes::Aes192>(&self.0, plaintext),
            32 => cbc_encrypt::<aes::Aes256>(&self.0, plaintext),
            n => Err(CryptoTcpError::Crypto(format!("invalid session key length {}", n))),
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.0.len() {
            16 => cbc_decrypt::<aes::Aes128>(&self.0, ciphertext),
            24 => cbc_decrypt::<aes::Aes192>(&self.0, ciphertext),
            32 => cbc_decrypt::<aes::Aes256>(&self.0, ciphertext),
            n => Err(CryptoTcpError::Crypto(format!("invalid session key length {}", n))),
        }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({} bytes)", self.0.len())
    }
}

fn cbc_encrypt<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let cipher = cbc::Encryptor::<C>::new_from_slices(key, &key[..AES_BLOCK_SIZE])
        .map_err(|e| CryptoTcpError::Crypto(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt<C>(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let cipher = cbc::Decryptor::<C>::new_from_slices(key, &key[..AES_BLOCK_SIZE])
        .map_err(|e| CryptoTcpError::Crypto(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoTcpError::Crypto("bad padding in ciphertext".to_string()))
}
