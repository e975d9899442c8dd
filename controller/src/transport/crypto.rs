//! Optional symmetric framing for the replication channel.
//!
//! Wire layout when enabled: `IV (16) || AES-256-CBC ciphertext || HMAC-SHA256 (32)`
//! with the MAC computed over `IV || ciphertext`. Both keys are derived
//! from the configured shared key with domain-separated SHA-256, so the
//! encryption and authentication keys differ even though operators supply
//! a single passphrase.
//!
//! Peers with a different key produce frames that fail MAC verification;
//! those are dropped without decrypting.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("frame too short")]
    TooShort,

    #[error("authentication failed")]
    BadMac,

    #[error("bad padding")]
    BadPadding,

    #[error("frame is not valid UTF-8")]
    Utf8,
}

struct SymmetricKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

/// Seals and opens replication frames. With no shared key configured this
/// is a transparent pass-through.
pub enum FrameCipher {
    Plaintext,
    Symmetric(Box<SymmetricState>),
}

pub struct SymmetricState {
    keys: SymmetricKeys,
}

fn derive_key(shared_key: &str, domain: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(shared_key.as_bytes());
    hasher.finalize().into()
}

impl FrameCipher {
    pub fn plaintext() -> Self {
        FrameCipher::Plaintext
    }

    pub fn symmetric(shared_key: &str) -> Self {
        FrameCipher::Symmetric(Box::new(SymmetricState {
            keys: SymmetricKeys {
                enc: derive_key(shared_key, b"dawn cbc v1"),
                mac: derive_key(shared_key, b"dawn hmac v1"),
            },
        }))
    }

    pub fn from_config(use_symm_enc: bool, shared_key: &str) -> Self {
        if use_symm_enc {
            Self::symmetric(shared_key)
        } else {
            Self::plaintext()
        }
    }

    pub fn seal(&self, frame: &str) -> Vec<u8> {
        match self {
            FrameCipher::Plaintext => frame.as_bytes().to_vec(),
            FrameCipher::Symmetric(state) => {
                let iv: [u8; IV_LEN] = rand::random();
                let ciphertext = Aes256CbcEnc::new(&state.keys.enc.into(), &iv.into())
                    .encrypt_padded_vec_mut::<Pkcs7>(frame.as_bytes());

                let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ciphertext);

                let mut mac = HmacSha256::new_from_slice(&state.keys.mac)
                    .expect("HMAC accepts any key length");
                mac.update(&out);
                out.extend_from_slice(&mac.finalize().into_bytes());
                out
            }
        }
    }

    pub fn open(&self, wire: &[u8]) -> Result<String, CryptoError> {
        match self {
            FrameCipher::Plaintext => {
                String::from_utf8(wire.to_vec()).map_err(|_| CryptoError::Utf8)
            }
            FrameCipher::Symmetric(state) => {
                if wire.len() < IV_LEN + MAC_LEN {
                    return Err(CryptoError::TooShort);
                }
                let (signed, tag) = wire.split_at(wire.len() - MAC_LEN);

                let mut mac = HmacSha256::new_from_slice(&state.keys.mac)
                    .expect("HMAC accepts any key length");
                mac.update(signed);
                mac.verify_slice(tag).map_err(|_| CryptoError::BadMac)?;

                let (iv, ciphertext) = signed.split_at(IV_LEN);
                let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::TooShort)?;
                let plaintext = Aes256CbcDec::new(&state.keys.enc.into(), &iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| CryptoError::BadPadding)?;

                String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
            }
        }
    }
}
