//! Cryptographic primitives for the device protocol.
//!
//! RSA-1024 OAEP (SHA-1) for the handshake blocks, chained AES-128-CBC
//! for the session streams, HMAC-SHA1 for handshake digests, CRC32 for
//! chunk receipts, OS-backed randoms.

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use thiserror::Error;

pub const AES_BLOCK: usize = 16;
pub const AES_KEY_LEN: usize = 16;
pub const SESSION_SECRET_LEN: usize = 40;
pub const HMAC_LEN: usize = 20;
pub const RSA_BITS: usize = 1024;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("public key der encoding failed: {0}")]
    KeyDer(#[from] rsa::pkcs8::spki::Error),
    #[error("ciphertext length {got} is not a positive multiple of {AES_BLOCK}")]
    BadCiphertextLength { got: usize },
    #[error("cipher padding invalid")]
    BadPadding,
}

/// The gateway's RSA identity.
#[derive(Debug, Clone)]
pub struct ServerKeys {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl ServerKeys {
    pub fn new(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::new(RsaPrivateKey::new(&mut OsRng, RSA_BITS)?))
    }
}

pub fn rsa_encrypt(key: &RsaPublicKey, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), plain)?)
}

pub fn rsa_decrypt(key: &RsaPrivateKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(key.decrypt(Oaep::new::<Sha1>(), cipher)?)
}

/// PKCS#1 v1.5 signature (SHA-1) with the server private key.
pub fn rsa_sign(key: &RsaPrivateKey, data: &[u8]) -> Vec<u8> {
    let signer = rsa::pkcs1v15::SigningKey::<Sha1>::new(key.clone());
    signer.sign(data).to_vec()
}

pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    Ok(key.to_public_key_der()?.as_bytes().to_vec())
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// CRC-32/IEEE, as carried in chunk receipts.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn nonce_40() -> [u8; SESSION_SECRET_LEN] {
    let mut bytes = [0u8; SESSION_SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn rand_u16() -> u16 {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    u16::from_le_bytes(bytes)
}

/// Split a 40-byte session secret into `(key, iv_send, iv_recv)`.
///
/// The windows are `[0..16]`, `[16..32]` and `[24..40]`; "send" is the
/// server-to-device direction. Both ends derive identically.
pub fn split_session_secret(
    secret: &[u8; SESSION_SECRET_LEN],
) -> ([u8; AES_KEY_LEN], [u8; AES_BLOCK], [u8; AES_BLOCK]) {
    let mut key = [0u8; AES_KEY_LEN];
    let mut iv_send = [0u8; AES_BLOCK];
    let mut iv_recv = [0u8; AES_BLOCK];
    key.copy_from_slice(&secret[..16]);
    iv_send.copy_from_slice(&secret[16..32]);
    iv_recv.copy_from_slice(&secret[24..40]);
    (key, iv_send, iv_recv)
}

/// One direction of the AES-128-CBC session.
///
/// Each call processes one whole message with PKCS#7 padding; the IV
/// then advances to the last ciphertext block, chaining successive
/// messages.
#[derive(Clone)]
pub struct CbcStream {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_BLOCK],
}

impl CbcStream {
    pub fn new(key: [u8; AES_KEY_LEN], iv: [u8; AES_BLOCK]) -> Self {
        Self { key, iv }
    }

    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        let enc = Aes128CbcEnc::new(&self.key.into(), &self.iv.into());
        let out = enc.encrypt_padded_vec_mut::<Pkcs7>(plain);
        self.iv.copy_from_slice(&out[out.len() - AES_BLOCK..]);
        out
    }

    pub fn decrypt(&mut self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.is_empty() || !cipher.len().is_multiple_of(AES_BLOCK) {
            return Err(CryptoError::BadCiphertextLength { got: cipher.len() });
        }
        let mut next_iv = [0u8; AES_BLOCK];
        next_iv.copy_from_slice(&cipher[cipher.len() - AES_BLOCK..]);
        let dec = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        let out = dec
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|_| CryptoError::BadPadding)?;
        self.iv = next_iv;
        Ok(out)
    }
}
