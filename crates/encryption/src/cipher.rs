//! AES-256-CFB File Cipher
//!
//! Streams submission files through AES-256 in CFB-128 mode with PKCS#5
//! padding, the layout servers expect for `.enc` files:
//!
//! ```text
//! ciphertext = CFB128-AES256(key, iv, plaintext || pad)
//! pad        = n bytes of value n, 1 <= n <= 16
//! ```
//!
//! Files are processed in fixed-size chunks so memory stays bounded no matter
//! how large an attachment is. The plaintext MD5 is computed on the same pass
//! for the manifest signature.

use crate::error::{EncryptionError, Result};
use crate::keymaterial::{SymmetricKey, IV_SIZE};
use aes::Aes256;
use cipher::KeyIvInit;
use md5::{Digest, Md5};
use std::io::{ErrorKind, Read, Write};
use zeroize::Zeroize;

/// AES block size (128 bits / 16 bytes)
pub const BLOCK_SIZE: usize = 16;

/// Read/write chunk size
const CHUNK_SIZE: usize = 64 * 1024;

type Aes256CfbEnc = cfb_mode::BufEncryptor<Aes256>;
type Aes256CfbDec = cfb_mode::BufDecryptor<Aes256>;

/// Byte counts and plaintext digest of one streamed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDigest {
    pub plaintext_md5: [u8; 16],
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
}

impl StreamDigest {
    /// Lowercase, zero-padded 32 character hex
    pub fn md5_hex(&self) -> String {
        hex::encode(self.plaintext_md5)
    }
}

fn read_chunk<R: Read>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buffer) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Encrypt everything `reader` yields into `writer`.
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &SymmetricKey,
    iv: &[u8; IV_SIZE],
) -> std::io::Result<StreamDigest> {
    let mut cipher = Aes256CfbEnc::new(key.as_bytes().into(), iv.into());
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut plaintext_len = 0u64;

    loop {
        let read = read_chunk(&mut reader, &mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = &mut buffer[..read];
        hasher.update(&*chunk);
        cipher.encrypt(chunk);
        writer.write_all(chunk)?;
        plaintext_len += read as u64;
    }
    buffer.zeroize();

    let pad_len = BLOCK_SIZE - (plaintext_len % BLOCK_SIZE as u64) as usize;
    let mut padding = [pad_len as u8; BLOCK_SIZE];
    cipher.encrypt(&mut padding[..pad_len]);
    writer.write_all(&padding[..pad_len])?;
    writer.flush()?;

    Ok(StreamDigest {
        plaintext_md5: hasher.finalize().into(),
        plaintext_len,
        ciphertext_len: plaintext_len + pad_len as u64,
    })
}

/// Decrypt a stream produced by [`encrypt_stream`].
///
/// The final block is held back until the end of input so the padding can be
/// checked and stripped. On error, `writer` may already hold a prefix of the
/// plaintext.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &SymmetricKey,
    iv: &[u8; IV_SIZE],
) -> Result<StreamDigest> {
    let mut cipher = Aes256CfbDec::new(key.as_bytes().into(), iv.into());
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut held: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE);
    let mut ciphertext_len = 0u64;
    let mut plaintext_len = 0u64;

    loop {
        let read = read_chunk(&mut reader, &mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = &mut buffer[..read];
        cipher.decrypt(chunk);
        held.extend_from_slice(chunk);
        ciphertext_len += read as u64;

        if held.len() > BLOCK_SIZE {
            let ready = held.len() - BLOCK_SIZE;
            hasher.update(&held[..ready]);
            writer.write_all(&held[..ready])?;
            plaintext_len += ready as u64;
            held.drain(..ready);
        }
    }
    buffer.zeroize();

    if ciphertext_len == 0 || ciphertext_len % BLOCK_SIZE as u64 != 0 {
        return Err(EncryptionError::InvalidCiphertextLength(ciphertext_len));
    }

    let pad_len = held[BLOCK_SIZE - 1] as usize;
    if pad_len == 0
        || pad_len > BLOCK_SIZE
        || held[BLOCK_SIZE - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
    {
        held.zeroize();
        return Err(EncryptionError::InvalidPadding);
    }

    let tail = &held[..BLOCK_SIZE - pad_len];
    hasher.update(tail);
    writer.write_all(tail)?;
    writer.flush()?;
    plaintext_len += tail.len() as u64;
    held.zeroize();

    Ok(StreamDigest {
        plaintext_md5: hasher.finalize().into(),
        plaintext_len,
        ciphertext_len,
    })
}

/// In-memory encryption
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey, iv: &[u8; IV_SIZE]) -> Result<Vec<u8>> {
    let mut ciphertext = Vec::with_capacity(plaintext.len() + BLOCK_SIZE);
    encrypt_stream(plaintext, &mut ciphertext, key, iv)?;
    Ok(ciphertext)
}

/// In-memory decryption
pub fn decrypt(ciphertext: &[u8], key: &SymmetricKey, iv: &[u8; IV_SIZE]) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(ciphertext.len());
    decrypt_stream(ciphertext, &mut plaintext, key, iv)?;
    Ok(plaintext)
}
