//! Streaming block encryption for file bodies
//!
//! Encrypted block format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = block_index (8 bytes, BE) || is_last (1 byte) || file_id (32 bytes)
//! ```
//!
//! Every full block is exactly `ENCRYPTED_BLOCK_SIZE` bytes. The final block
//! carries `is_last = 1` and may be short or empty, so truncation at a block
//! boundary, reordering and cross-file splicing all fail authentication.

use std::io::{self, Read, Write};

use anyhow::Context;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::keys::FileKey;
use crate::{ENCRYPTED_BLOCK_SIZE, FILE_ID_SIZE, NONCE_SIZE, PLAIN_BLOCK_SIZE, TAG_SIZE};

pub type FileId = [u8; FILE_ID_SIZE];

pub fn generate_file_id() -> FileId {
    let mut id = [0u8; FILE_ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Encrypt `plain` into `out`. Returns the number of plaintext bytes.
pub fn encrypt_stream(
    key: &FileKey,
    file_id: &FileId,
    plain: &mut dyn Read,
    out: &mut dyn Write,
) -> anyhow::Result<u64> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut total = 0u64;
    let mut index = 0u64;
    let mut current = read_up_to(plain, PLAIN_BLOCK_SIZE).context("reading plaintext")?;

    loop {
        let next = if current.len() == PLAIN_BLOCK_SIZE {
            read_up_to(plain, PLAIN_BLOCK_SIZE).context("reading plaintext")?
        } else {
            Zeroizing::new(Vec::new())
        };
        let is_last = next.is_empty();

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &current,
                    aad: &block_aad(index, is_last, file_id),
                },
            )
            .map_err(|e| anyhow::anyhow!("block {index} encryption failed: {e}"))?;
        out.write_all(&nonce)?;
        out.write_all(&sealed)?;

        total += current.len() as u64;
        if is_last {
            return Ok(total);
        }
        current = next;
        index += 1;
    }
}

/// Decrypt a body written by [`encrypt_stream`]. Returns the number of
/// plaintext bytes written.
pub fn decrypt_stream(
    key: &FileKey,
    file_id: &FileId,
    body: &mut dyn Read,
    out: &mut dyn Write,
) -> anyhow::Result<u64> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut total = 0u64;
    let mut index = 0u64;
    let mut current = read_up_to(body, ENCRYPTED_BLOCK_SIZE).context("reading ciphertext")?;
    if current.is_empty() {
        anyhow::bail!("ciphertext body is empty");
    }

    loop {
        let next = if current.len() == ENCRYPTED_BLOCK_SIZE {
            read_up_to(body, ENCRYPTED_BLOCK_SIZE).context("reading ciphertext")?
        } else {
            Zeroizing::new(Vec::new())
        };
        let is_last = next.is_empty();

        if current.len() < NONCE_SIZE + TAG_SIZE {
            anyhow::bail!("block {index} truncated to {} bytes", current.len());
        }
        let (nonce, sealed) = current.split_at(NONCE_SIZE);
        let plain = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(nonce),
                    Payload {
                        msg: sealed,
                        aad: &block_aad(index, is_last, file_id),
                    },
                )
                .map_err(|_| {
                    anyhow::anyhow!("block {index} failed authentication: wrong key, corrupted or truncated data")
                })?,
        );
        out.write_all(&plain)?;

        total += plain.len() as u64;
        if is_last {
            return Ok(total);
        }
        current = next;
        index += 1;
    }
}

fn block_aad(index: u64, is_last: bool, file_id: &FileId) -> [u8; 8 + 1 + FILE_ID_SIZE] {
    let mut aad = [0u8; 8 + 1 + FILE_ID_SIZE];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(is_last);
    aad[9..].copy_from_slice(file_id);
    aad
}

/// Read until `limit` bytes or EOF.
fn read_up_to(reader: &mut dyn Read, limit: usize) -> io::Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(limit));
    reader.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_file_key;
    use proptest::prelude::*;

    fn seal(key: &FileKey, id: &FileId, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(key, id, &mut &data[..], &mut out).unwrap();
        out
    }

    fn open(key: &FileKey, id: &FileId, body: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(key, id, &mut &body[..], &mut out)?;
        Ok(out)
    }

    #[test]
    fn empty_file_is_one_short_block() {
        let key = generate_file_key();
        let id = generate_file_id();
        let body = seal(&key, &id, b"");
        assert_eq!(body.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(open(&key, &id, &body).unwrap(), b"");
    }

    #[test]
    fn full_blocks_are_fixed_size() {
        let key = generate_file_key();
        let id = generate_file_id();
        let data = vec![7u8; PLAIN_BLOCK_SIZE * 2 + 5];
        let body = seal(&key, &id, &data);
        assert_eq!(body.len(), ENCRYPTED_BLOCK_SIZE * 2 + NONCE_SIZE + 5 + TAG_SIZE);
        assert_eq!(open(&key, &id, &body).unwrap(), data);
    }

    #[test]
    fn exact_multiple_of_block_size() {
        let key = generate_file_key();
        let id = generate_file_id();
        let data = vec![1u8; PLAIN_BLOCK_SIZE * 2];
        let body = seal(&key, &id, &data);
        assert_eq!(body.len(), ENCRYPTED_BLOCK_SIZE * 2);
        assert_eq!(open(&key, &id, &body).unwrap(), data);
    }

    #[test]
    fn truncation_at_block_boundary_fails() {
        let key = generate_file_key();
        let id = generate_file_id();
        let body = seal(&key, &id, &vec![3u8; PLAIN_BLOCK_SIZE * 3]);
        assert!(open(&key, &id, &body[..ENCRYPTED_BLOCK_SIZE * 2]).is_err());
        assert!(open(&key, &id, &[]).is_err());
    }

    #[test]
    fn swapped_blocks_fail() {
        let key = generate_file_key();
        let id = generate_file_id();
        let body = seal(&key, &id, &vec![9u8; PLAIN_BLOCK_SIZE * 2 + 1]);
        let mut swapped = body[ENCRYPTED_BLOCK_SIZE..ENCRYPTED_BLOCK_SIZE * 2].to_vec();
        swapped.extend_from_slice(&body[..ENCRYPTED_BLOCK_SIZE]);
        swapped.extend_from_slice(&body[ENCRYPTED_BLOCK_SIZE * 2..]);
        assert!(open(&key, &id, &swapped).is_err());
    }

    #[test]
    fn other_file_id_or_key_fails() {
        let key = generate_file_key();
        let id = generate_file_id();
        let body = seal(&key, &id, b"secret");
        assert!(open(&key, &generate_file_id(), &body).is_err());
        assert!(open(&generate_file_key(), &id, &body).is_err());
    }

    #[test]
    fn tampered_byte_fails() {
        let key = generate_file_key();
        let id = generate_file_id();
        let mut body = seal(&key, &id, b"secret data");
        body[NONCE_SIZE + 1] ^= 0xFF;
        assert!(open(&key, &id, &body).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_length_survives(len in 0usize..(PLAIN_BLOCK_SIZE * 3 + 17)) {
            let key = generate_file_key();
            let id = generate_file_id();
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let body = seal(&key, &id, &data);
            prop_assert_eq!(open(&key, &id, &body).unwrap(), data);
        }
    }
}
