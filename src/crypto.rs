//! Segment decryption
//!
//! HLS AES-128: whole-segment AES-CBC with PKCS#7 padding, key fetched
//! lazily from the key URI, IV defaulting to the 16-byte big-endian
//! media sequence number. The cipher itself sits behind the [`Crypto`]
//! capability so platforms can substitute hardware-backed crypto.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Category, Code, Result, Severity, StreamingError};
use crate::manifest::{AesKey, AesMethod};

/// Parameters for one decrypt call.
#[derive(Debug, Clone)]
pub struct DecryptParams {
    pub method: AesMethod,
    pub iv: [u8; 16],
}

/// The crypto capability: key import plus block decryption.
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Import raw key bytes into whatever form `decrypt` wants.
    async fn import_key(&self, raw: &[u8]) -> Result<Bytes>;

    /// Decrypt one segment.
    async fn decrypt(&self, params: &DecryptParams, key: &[u8], data: &[u8]) -> Result<Bytes>;
}

fn transform_error(message: impl Into<String>) -> StreamingError {
    StreamingError::new(
        Severity::Critical,
        Category::Media,
        Code::ContentTransformationFailed,
        message,
    )
}

/// Software AES-128 implementation.
pub struct SoftwareCrypto;

#[async_trait]
impl Crypto for SoftwareCrypto {
    async fn import_key(&self, raw: &[u8]) -> Result<Bytes> {
        if raw.len() != 16 {
            return Err(transform_error(format!(
                "AES-128 key must be 16 bytes, got {}",
                raw.len()
            )));
        }
        Ok(Bytes::copy_from_slice(raw))
    }

    async fn decrypt(&self, params: &DecryptParams, key: &[u8], data: &[u8]) -> Result<Bytes> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| transform_error("AES-128 key must be 16 bytes"))?;
        match params.method {
            AesMethod::Cbc => {
                use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
                type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
                let plain = Aes128CbcDec::new(&key.into(), &params.iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(data)
                    .map_err(|e| transform_error(format!("CBC decrypt failed: {e}")))?;
                Ok(Bytes::from(plain))
            }
            AesMethod::Ctr => {
                use aes::cipher::{KeyIvInit, StreamCipher};
                type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
                let mut buf = data.to_vec();
                let mut cipher = Aes128Ctr::new(&key.into(), &params.iv.into());
                cipher.apply_keystream(&mut buf);
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Derive the default IV: a 16-byte big-endian media sequence number.
pub fn iv_from_sequence_number(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Decrypts media segments, fetching and importing the key on first use.
pub struct Decryptor<C: Crypto + ?Sized> {
    crypto: std::sync::Arc<C>,
}

impl<C: Crypto + ?Sized> Decryptor<C> {
    pub fn new(crypto: std::sync::Arc<C>) -> Self {
        Self { crypto }
    }

    /// Decrypt one segment. `media_sequence` is the segment's position in
    /// the playlist; it feeds the IV when the key declares none.
    pub async fn decrypt(
        &self,
        data: Bytes,
        key: &AesKey,
        media_sequence: u64,
    ) -> Result<Bytes> {
        let key_bytes = match key.crypto_key() {
            Some(k) => k,
            None => {
                // Single-flight: another track may be fetching the same
                // key right now.
                let _gate = key.fetch_gate().lock().await;
                match key.crypto_key() {
                    Some(k) => k,
                    None => {
                        let fetch = key.fetcher().ok_or_else(|| {
                            transform_error(
                                "encrypted segment with neither key bytes nor key fetcher",
                            )
                        })?;
                        tracing::debug!("fetching AES key for encrypted segment");
                        let raw = fetch().await?;
                        let imported = self.crypto.import_key(&raw).await?;
                        key.set_crypto_key(imported.clone());
                        imported
                    }
                }
            }
        };

        let iv = key
            .iv
            .unwrap_or_else(|| iv_from_sequence_number(media_sequence));
        let params = DecryptParams {
            method: key.method,
            iv,
        };
        self.crypto.decrypt(&params, &key_bytes, &data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn encrypt_cbc(key: &[u8; 16], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
        Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    #[test]
    fn test_iv_from_sequence_number() {
        let iv = iv_from_sequence_number(7);
        assert_eq!(&iv[..15], &[0u8; 15]);
        assert_eq!(iv[15], 7);
        let iv = iv_from_sequence_number(0x0102);
        assert_eq!(iv[14], 1);
        assert_eq!(iv[15], 2);
    }

    #[tokio::test]
    async fn test_cbc_round_trip() {
        let key = [0x42u8; 16];
        let iv = iv_from_sequence_number(3);
        let plain = b"some media segment payload";
        let encrypted = encrypt_cbc(&key, &iv, plain);

        let crypto = SoftwareCrypto;
        let out = crypto
            .decrypt(
                &DecryptParams {
                    method: AesMethod::Cbc,
                    iv,
                },
                &key,
                &encrypted,
            )
            .await
            .unwrap();
        assert_eq!(&out[..], plain);
    }

    #[tokio::test]
    async fn test_import_key_rejects_bad_length() {
        let crypto = SoftwareCrypto;
        assert!(crypto.import_key(&[1u8; 15]).await.is_err());
        assert!(crypto.import_key(&[1u8; 16]).await.is_ok());
    }

    #[tokio::test]
    async fn test_lazy_key_fetched_once() {
        let key_bytes = [9u8; 16];
        let fetches = Arc::new(AtomicUsize::new(0));
        let f = fetches.clone();
        let key = AesKey::with_fetcher(AesMethod::Cbc, move || {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::copy_from_slice(&[9u8; 16]))
            }
        });

        let decryptor = Decryptor::new(Arc::new(SoftwareCrypto));
        let iv = iv_from_sequence_number(0);
        let encrypted = encrypt_cbc(&key_bytes, &iv, b"first");
        decryptor
            .decrypt(Bytes::from(encrypted), &key, 0)
            .await
            .unwrap();

        let iv = iv_from_sequence_number(1);
        let encrypted = encrypt_cbc(&key_bytes, &iv, b"second");
        decryptor
            .decrypt(Bytes::from(encrypted), &key, 1)
            .await
            .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(key.crypto_key().is_some());
    }

    #[tokio::test]
    async fn test_explicit_iv_wins() {
        let key_bytes = [5u8; 16];
        let explicit_iv = [0xAAu8; 16];
        let key = AesKey::with_key(AesMethod::Cbc, Bytes::copy_from_slice(&key_bytes))
            .iv(explicit_iv);

        let encrypted = encrypt_cbc(&key_bytes, &explicit_iv, b"payload");
        let decryptor = Decryptor::new(Arc::new(SoftwareCrypto));
        // media_sequence would derive a different IV; the explicit one must win.
        let out = decryptor
            .decrypt(Bytes::from(encrypted), &key, 99)
            .await
            .unwrap();
        assert_eq!(&out[..], b"payload");
    }
}
