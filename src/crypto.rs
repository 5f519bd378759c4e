//! Tuya protocol encryption and decryption logic.
//! Supports AES-128-ECB (v3.1, v3.3, v3.4) and AES-128-GCM (v3.5), HMAC-SHA256
//! proofs and the session key derivation used by v3.4+ handshakes.
//!
//! Everything here is stateless apart from the key material handed in, so the
//! functions can be called from any number of sessions concurrently.

use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;
pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Device key material: the pre-shared local key and the negotiated session key.
#[derive(Clone)]
pub struct KeyStore {
    local_key: [u8; KEY_LEN],
    session_key: Option<[u8; KEY_LEN]>,
}

impl KeyStore {
    pub fn new(local_key: &[u8]) -> Result<Self> {
        Ok(Self {
            local_key: to_key(local_key)?,
            session_key: None,
        })
    }

    pub fn local_key(&self) -> &[u8; KEY_LEN] {
        &self.local_key
    }

    pub fn session_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.session_key.as_ref()
    }

    /// Key used for payload encryption and integrity: the session key once negotiated.
    pub fn active_key(&self) -> &[u8; KEY_LEN] {
        self.session_key.as_ref().unwrap_or(&self.local_key)
    }

    pub fn set_session_key(&mut self, key: [u8; KEY_LEN]) {
        self.session_key = Some(key);
    }

    pub fn clear_session_key(&mut self) {
        self.session_key = None;
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("local_key", &"<redacted>")
            .field("session_key", &self.session_key.map(|_| "<redacted>"))
            .finish()
    }
}

fn to_key(key: &[u8]) -> Result<[u8; KEY_LEN]> {
    key.try_into().map_err(|_| TuyaError::InvalidKey(key.len()))
}

/// TuyaCipher provides AES-128 encryption and decryption in ECB and GCM modes.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; KEY_LEN],
    /// Cached GCM cipher
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let k = to_key(key)?;
        let gcm = Aes128Gcm::new(GenericArray::from_slice(&k));
        Ok(Self { key: k, gcm })
    }

    /// ECB encryption. `padding` applies PKCS#7; without it the input must be block aligned.
    pub fn encrypt_ecb(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(GenericArray::from_slice(&self.key));

        let mut buf = data.to_vec();
        if padding {
            let padding_len = BLOCK_LEN - data.len() % BLOCK_LEN;
            buf.resize(data.len() + padding_len, padding_len as u8);
        } else if !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(TuyaError::EncryptionFailed);
        }

        for chunk in buf.chunks_mut(BLOCK_LEN) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    /// ECB decryption with PKCS#7 validation.
    pub fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(TuyaError::Decode(format!(
                "ciphertext length {} is not a positive multiple of {}",
                data.len(),
                BLOCK_LEN
            )));
        }

        let mut decryptor = Decryptor::<Aes128>::new(GenericArray::from_slice(&self.key));
        let mut plaintext = data.to_vec();
        for chunk in plaintext.chunks_mut(BLOCK_LEN) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }

        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > BLOCK_LEN {
            return Err(TuyaError::Decode("invalid PKCS#7 padding".into()));
        }
        if plaintext[plaintext.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
        {
            return Err(TuyaError::Decode("invalid PKCS#7 padding".into()));
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }

    /// GCM encryption returning ciphertext and detached tag.
    pub fn encrypt_gcm(
        &self,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN])> {
        check_nonce(nonce)?;
        let nonce = Nonce::from_slice(&nonce[..GCM_NONCE_LEN]);
        let mut buf = plaintext.to_vec();
        let tag = self
            .gcm
            .encrypt_in_place_detached(nonce, aad, &mut buf)
            .map_err(|_| TuyaError::EncryptionFailed)?;
        let mut tag_bytes = [0u8; GCM_TAG_LEN];
        tag_bytes.copy_from_slice(&tag);
        Ok((buf, tag_bytes))
    }

    /// GCM decryption. A tag that does not verify is an authentication failure.
    pub fn decrypt_gcm(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        check_nonce(nonce)?;
        let nonce = Nonce::from_slice(&nonce[..GCM_NONCE_LEN]);
        if tag.len() != GCM_TAG_LEN {
            return Err(TuyaError::Decode(format!("GCM tag length {}", tag.len())));
        }
        let mut buf = ciphertext.to_vec();
        self.gcm
            .decrypt_in_place_detached(nonce, aad, &mut buf, Tag::from_slice(tag))
            .map_err(|_| TuyaError::Authentication("GCM tag mismatch".into()))?;
        Ok(buf)
    }
}

fn check_nonce(nonce: &[u8]) -> Result<()> {
    if nonce.len() < GCM_NONCE_LEN {
        return Err(TuyaError::Decode(format!("GCM nonce length {}", nonce.len())));
    }
    Ok(())
}

pub fn encrypt_ecb(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    TuyaCipher::new(key)?.encrypt_ecb(plaintext, true)
}

pub fn decrypt_ecb(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    TuyaCipher::new(key)?.decrypt_ecb(ciphertext)
}

pub fn encrypt_gcm(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN])> {
    TuyaCipher::new(key)?.encrypt_gcm(nonce, plaintext, aad)
}

pub fn decrypt_gcm(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    TuyaCipher::new(key)?.decrypt_gcm(nonce, ciphertext, tag, aad)
}

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(message);
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time comparison of `expected` against HMAC-SHA256(key, message).
pub fn verify_hmac_sha256(key: &[u8], message: &[u8], expected: &[u8]) -> Result<bool> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(message);
    Ok(mac.verify_slice(expected).is_ok())
}

/// Derives the v3.4/v3.5 session key from both handshake nonces.
///
/// The nonces are XORed byte-wise; the result is then encrypted with the
/// device's local key (ECB for 3.4, GCM keyed on the first 12 bytes of the local
/// nonce for 3.5, keeping only the ciphertext).
pub fn generate_session_key(
    local_nonce: &[u8],
    remote_nonce: &[u8],
    device_key: &[u8],
    version: Version,
) -> Result<[u8; KEY_LEN]> {
    if local_nonce.len() != KEY_LEN || remote_nonce.len() != KEY_LEN {
        return Err(TuyaError::Authentication(format!(
            "nonce lengths {}/{} (expected {})",
            local_nonce.len(),
            remote_nonce.len(),
            KEY_LEN
        )));
    }

    let mixed: Vec<u8> = local_nonce
        .iter()
        .zip(remote_nonce)
        .map(|(l, r)| l ^ r)
        .collect();

    let cipher = TuyaCipher::new(device_key)?;
    let derived = if version >= Version::V3_5 {
        cipher.encrypt_gcm(&local_nonce[..GCM_NONCE_LEN], &mixed, &[])?.0
    } else {
        cipher.encrypt_ecb(&mixed, false)?
    };
    to_key(&derived[..KEY_LEN])
}

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}
