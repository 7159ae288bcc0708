//! Streaming AES-256-CBC decryption for upload bodies.
//!
//! Mirrors `original_source/tsdfileapi/api.py`'s `aes_decryption_args_from_headers`:
//! when `Aes-Iv` is present the decrypted `Aes-Key` header is a hex-encoded
//! raw key (`openssl enc -iv <iv> -K <key>`); when absent it is a passphrase,
//! and the ciphertext is an `openssl enc`-style stream prefixed with
//! `Salted__` + an 8-byte salt, key and IV derived from it via OpenSSL's
//! `EVP_BytesToKey` (MD5, one iteration).

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use md5::{Digest, Md5};

use crate::error::{ServerError, ServerResult};

type Decryptor = cbc::Decryptor<Aes256>;

const BLOCK_SIZE: usize = 16;
const OPENSSL_MAGIC: &[u8] = b"Salted__";

/// How the caller supplied key material for this upload.
pub enum AesKeySource {
    /// `Aes-Iv` was present: `key` is the raw 32-byte AES key, `iv` is the
    /// raw 16-byte initialization vector.
    Explicit { key: [u8; 32], iv: [u8; 16] },
    /// `Aes-Iv` was absent: `passphrase` must be combined with a salt read
    /// from the start of the ciphertext stream.
    Passphrase(Vec<u8>),
}

impl AesKeySource {
    pub fn explicit(key_hex: &str, iv_hex: &str) -> ServerResult<Self> {
        let key = decode_hex_array::<32>(key_hex)?;
        let iv = decode_hex_array::<16>(iv_hex)?;
        Ok(Self::Explicit { key, iv })
    }

    pub fn passphrase(decrypted_aes_key: Vec<u8>) -> Self {
        Self::Passphrase(decrypted_aes_key)
    }
}

fn decode_hex_array<const N: usize>(s: &str) -> ServerResult<[u8; N]> {
    let bytes =
        hex::decode(s.trim()).map_err(|_| ServerError::PolicyRejected("malformed AES hex parameter".to_owned()))?;
    bytes
        .try_into()
        .map_err(|_| ServerError::PolicyRejected(format!("expected {N} bytes of AES key material")))
}

/// OpenSSL's legacy `EVP_BytesToKey` with MD5 and a single iteration,
/// deriving a 32-byte key and 16-byte IV from a passphrase and an 8-byte
/// salt.
fn evp_bytes_to_key_md5(passphrase: &[u8], salt: &[u8; 8]) -> ([u8; 32], [u8; 16]) {
    let mut derived = Vec::with_capacity(48);
    let mut prev: Vec<u8> = Vec::new();

    while derived.len() < 48 {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(passphrase);
        hasher.update(salt);
        let digest = hasher.finalize();
        derived.extend_from_slice(&digest);
        prev = digest.to_vec();
    }

    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&derived[..32]);
    iv.copy_from_slice(&derived[32..48]);
    (key, iv)
}

enum State {
    /// Buffering bytes until we have enough to determine the key/IV
    /// (immediately, for `Explicit`; after the `Salted__` header, for
    /// `Passphrase`).
    AwaitingHeader { source: AesKeySource, buffer: Vec<u8> },
    /// Decrypting; `held_back` is the most recent full ciphertext block,
    /// withheld so it can be unpadded once the stream ends.
    Decrypting {
        decryptor: Decryptor,
        buffer: Vec<u8>,
        held_back: Option<[u8; BLOCK_SIZE]>,
    },
    Finished,
}

/// A stateful AES-256-CBC decoder fed one ciphertext chunk at a time.
pub struct AesCbcDecoder {
    state: State,
}

impl AesCbcDecoder {
    pub fn new(source: AesKeySource) -> Self {
        Self {
            state: State::AwaitingHeader {
                source,
                buffer: Vec::new(),
            },
        }
    }

    /// Feeds `data` through the decoder, returning newly available
    /// plaintext bytes (possibly empty, if still buffering).
    pub fn process(&mut self, data: &[u8]) -> ServerResult<Vec<u8>> {
        if let State::AwaitingHeader { .. } = &self.state {
            self.try_start(data)?;
        } else if let State::Decrypting { buffer, .. } = &mut self.state {
            buffer.extend_from_slice(data);
        } else {
            return Err(ServerError::InternalServerError);
        }

        self.drain_full_blocks()
    }

    fn try_start(&mut self, data: &[u8]) -> ServerResult<()> {
        let State::AwaitingHeader { source, buffer } = &mut self.state else {
            unreachable!()
        };
        buffer.extend_from_slice(data);

        let (key, iv, consumed_header) = match source {
            AesKeySource::Explicit { key, iv } => (*key, *iv, 0),
            AesKeySource::Passphrase(passphrase) => {
                if buffer.len() < OPENSSL_MAGIC.len() + 8 {
                    return Ok(());
                }
                if &buffer[..OPENSSL_MAGIC.len()] != OPENSSL_MAGIC {
                    return Err(ServerError::PolicyRejected(
                        "AES ciphertext missing OpenSSL salt header".to_owned(),
                    ));
                }
                let mut salt = [0u8; 8];
                salt.copy_from_slice(&buffer[OPENSSL_MAGIC.len()..OPENSSL_MAGIC.len() + 8]);
                let (key, iv) = evp_bytes_to_key_md5(passphrase, &salt);
                (key, iv, OPENSSL_MAGIC.len() + 8)
            }
        };

        let decryptor = Decryptor::new(&key.into(), &iv.into());
        let remaining = buffer[consumed_header..].to_vec();
        self.state = State::Decrypting {
            decryptor,
            buffer: remaining,
            held_back: None,
        };
        Ok(())
    }

    fn drain_full_blocks(&mut self) -> ServerResult<Vec<u8>> {
        let State::Decrypting {
            decryptor,
            buffer,
            held_back,
        } = &mut self.state
        else {
            return Ok(Vec::new());
        };

        let mut output = Vec::new();
        let mut offset = 0;

        // Always keep the most recent full block withheld: it may be the
        // final block and need PKCS7 unpadding at `finish()`.
        while buffer.len() - offset >= BLOCK_SIZE * 2 {
            if let Some(prev) = held_back.take() {
                let mut block = prev.into();
                decryptor.decrypt_block_mut(&mut block);
                output.extend_from_slice(&block);
            }
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&buffer[offset..offset + BLOCK_SIZE]);
            *held_back = Some(block);
            offset += BLOCK_SIZE;
        }

        buffer.drain(..offset);
        Ok(output)
    }

    /// Flushes and unpads the final block. Must be called exactly once,
    /// after all ciphertext has been passed to [`process`].
    pub fn finish(&mut self) -> ServerResult<Vec<u8>> {
        let state = std::mem::replace(&mut self.state, State::Finished);
        let State::Decrypting {
            mut decryptor,
            buffer,
            held_back,
        } = state
        else {
            return Err(ServerError::PolicyRejected(
                "AES ciphertext ended before a full key header was seen".to_owned(),
            ));
        };

        let mut output = Vec::new();
        if let Some(prev) = held_back {
            let mut block = prev.into();
            decryptor.decrypt_block_mut(&mut block);
            output.extend_from_slice(&block);
        }

        if buffer.len() == BLOCK_SIZE {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&buffer);
            let mut block = block.into();
            decryptor.decrypt_block_mut(&mut block);
            output.extend_from_slice(&block);
        } else if !buffer.is_empty() {
            return Err(ServerError::PolicyRejected(
                "AES ciphertext length is not a multiple of the block size".to_owned(),
            ));
        }

        unpad_pkcs7(&mut output)?;
        Ok(output)
    }
}

fn unpad_pkcs7(data: &mut Vec<u8>) -> ServerResult<()> {
    let pad_len = *data
        .last()
        .ok_or_else(|| ServerError::PolicyRejected("empty AES plaintext".to_owned()))? as usize;

    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return Err(ServerError::PolicyRejected("invalid PKCS7 padding".to_owned()));
    }
    if data[data.len() - pad_len..].iter().any(|&b| b as usize != pad_len) {
        return Err(ServerError::PolicyRejected("invalid PKCS7 padding".to_owned()));
    }

    data.truncate(data.len() - pad_len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    fn encrypt(key: [u8; 32], iv: [u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let mut padded = plaintext.to_vec();
        let pad_len = BLOCK_SIZE - (padded.len() % BLOCK_SIZE);
        padded.extend(std::iter::repeat(pad_len as u8).take(pad_len));

        let mut encryptor = cbc::Encryptor::<Aes256>::new(&key.into(), &iv.into());
        for chunk in padded.chunks_mut(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            let mut block = block.into();
            encryptor.encrypt_block_mut(&mut block);
            chunk.copy_from_slice(&block);
        }
        padded
    }

    #[test]
    fn test_explicit_key_roundtrip() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = encrypt(key, iv, plaintext);

        let mut decoder = AesCbcDecoder::new(AesKeySource::Explicit { key, iv });
        let mut out = decoder.process(&ciphertext).unwrap();
        out.extend(decoder.finish().unwrap());

        assert_eq!(out, plaintext);
    }

    #[test]
    fn test_split_across_chunks() {
        let key = [3u8; 32];
        let iv = [1u8; 16];
        let plaintext = vec![b'x'; 1000];
        let ciphertext = encrypt(key, iv, &plaintext);

        let mut decoder = AesCbcDecoder::new(AesKeySource::Explicit { key, iv });
        let mut out = Vec::new();
        for chunk in ciphertext.chunks(23) {
            out.extend(decoder.process(chunk).unwrap());
        }
        out.extend(decoder.finish().unwrap());

        assert_eq!(out, plaintext);
    }
}
