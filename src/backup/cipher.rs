//! Chunked AEAD encryption for backup artifacts.
//!
//! Artifact layout:
//!
//! ```text
//! header (33 bytes, authenticated as AAD of every frame)
//!   magic "DVLT" | version u8 | cipher id u8 | kdf iterations u32 LE | salt [16] | nonce prefix [7]
//! frames
//!   flag u8 (0 = more follows, 1 = final) | ciphertext len u32 LE | ciphertext + 16 byte tag
//! ```
//!
//! Frame nonce is `prefix || counter u32 BE || flag`. The final frame is always written, even
//! for an empty body, so a truncated artifact never decrypts cleanly.

use std::io::{self, Read, Write};

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

const MAGIC: &[u8; 4] = b"DVLT";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = 4 + 1 + 1 + 4 + SALT_LEN + NONCE_PREFIX_LEN;

/// Plaintext bytes sealed per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on key derivation work, enforced when writing and when reading a header.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherAlgorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    fn id(self) -> u8 {
        match self {
            CipherAlgorithm::Aes256Gcm => 1,
            CipherAlgorithm::ChaCha20Poly1305 => 2,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CipherAlgorithm::Aes256Gcm),
            2 => Some(CipherAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Some(CipherAlgorithm::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Some(CipherAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

enum FrameCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl FrameCipher {
    fn new(algorithm: CipherAlgorithm, key: &[u8; 32]) -> io::Result<Self> {
        let cipher = match algorithm {
            CipherAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(|c| FrameCipher::Aes(Box::new(c)))
                .map_err(|e| io::Error::other(format!("failed to create cipher: {}", e)))?,
            CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(|c| FrameCipher::ChaCha(Box::new(c)))
                .map_err(|e| io::Error::other(format!("failed to create cipher: {}", e)))?,
        };
        Ok(cipher)
    }

    fn seal(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let sealed = match self {
            FrameCipher::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            FrameCipher::ChaCha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        };
        sealed.map_err(|_| io::Error::other("frame encryption failed"))
    }

    fn open(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let opened = match self {
            FrameCipher::Aes(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            FrameCipher::ChaCha(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        };
        opened.map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "frame authentication failed (wrong password or corrupt artifact)",
            )
        })
    }
}

fn derive_key(secret: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut key);
    key
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, flag: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = flag;
    nonce
}

/// Streaming encryptor. Buffers at most one chunk of plaintext.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: FrameCipher,
    header: [u8; HEADER_LEN],
    header_written: bool,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buffer: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    /// Derives the key from `secret` with a fresh random salt and nonce prefix.
    pub fn new(inner: W, algorithm: CipherAlgorithm, secret: &str, iterations: u32) -> io::Result<Self> {
        if secret.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "encryption secret is empty",
            ));
        }
        if iterations == 0 || iterations > MAX_KDF_ITERATIONS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "key derivation iterations must be between 1 and {}, got {}",
                    MAX_KDF_ITERATIONS, iterations
                ),
            ));
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut nonce_prefix);

        let key = derive_key(secret, &salt, iterations);
        let cipher = FrameCipher::new(algorithm, &key)?;

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(MAGIC);
        header[4] = FORMAT_VERSION;
        header[5] = algorithm.id();
        header[6..10].copy_from_slice(&iterations.to_le_bytes());
        header[10..10 + SALT_LEN].copy_from_slice(&salt);
        header[10 + SALT_LEN..].copy_from_slice(&nonce_prefix);

        Ok(Self {
            inner,
            cipher,
            header,
            header_written: false,
            nonce_prefix,
            counter: 0,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    fn seal_frame(&mut self, flag: u8, len: usize) -> io::Result<()> {
        if !self.header_written {
            self.inner.write_all(&self.header)?;
            self.header_written = true;
        }

        let nonce = frame_nonce(&self.nonce_prefix, self.counter, flag);
        let sealed = self.cipher.seal(&nonce, &self.buffer[..len], &self.header)?;
        self.buffer.drain(..len);

        self.inner.write_all(&[flag])?;
        self.inner.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&sealed)?;

        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("artifact exceeds the maximum frame count"))?;
        Ok(())
    }

    /// Seals the remaining plaintext as the final frame and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let remaining = self.buffer.len();
        self.seal_frame(FLAG_FINAL, remaining)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buffer.len();
        let take = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.len() == CHUNK_SIZE {
            self.seal_frame(FLAG_MORE, CHUNK_SIZE)?;
        }
        Ok(take)
    }

    // Partial frames are only sealed by `finish`, so flushing just forwards.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming decryptor for artifacts written by [`EncryptWriter`].
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: FrameCipher,
    header: [u8; HEADER_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    plaintext: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, secret: &str) -> io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                invalid_data("artifact is shorter than its header")
            } else {
                e
            }
        })?;

        if &header[..4] != MAGIC {
            return Err(invalid_data("not a dumpvault artifact (bad magic)"));
        }
        if header[4] != FORMAT_VERSION {
            return Err(invalid_data(format!(
                "unsupported artifact version {}",
                header[4]
            )));
        }
        let algorithm = CipherAlgorithm::from_id(header[5])
            .ok_or_else(|| invalid_data(format!("unknown cipher id {}", header[5])))?;
        let mut iterations_bytes = [0u8; 4];
        iterations_bytes.copy_from_slice(&header[6..10]);
        let iterations = u32::from_le_bytes(iterations_bytes);
        if iterations == 0 || iterations > MAX_KDF_ITERATIONS {
            return Err(invalid_data(format!(
                "implausible key derivation iteration count {}",
                iterations
            )));
        }

        let key = derive_key(secret, &header[10..10 + SALT_LEN], iterations);
        let cipher = FrameCipher::new(algorithm, &key)?;
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&header[10 + SALT_LEN..]);

        Ok(Self {
            inner,
            cipher,
            header,
            nonce_prefix,
            counter: 0,
            plaintext: Vec::new(),
            position: 0,
            finished: false,
        })
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut flag = [0u8; 1];
        if self.inner.read(&mut flag)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "artifact is truncated (final frame missing)",
            ));
        }
        let flag = flag[0];
        if flag != FLAG_MORE && flag != FLAG_FINAL {
            return Err(invalid_data(format!("invalid frame flag {}", flag)));
        }

        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(invalid_data(format!("invalid frame length {}", len)));
        }

        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed)?;

        let nonce = frame_nonce(&self.nonce_prefix, self.counter, flag);
        self.plaintext = self.cipher.open(&nonce, &sealed, &self.header)?;
        self.position = 0;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| invalid_data("frame counter overflow"))?;

        if flag == FLAG_FINAL {
            self.finished = true;
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? != 0 {
                return Err(invalid_data("unexpected data after final frame"));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position == self.plaintext.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let available = &self.plaintext[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITERATIONS: u32 = 1_000;

    fn seal(payload: &[u8], algorithm: CipherAlgorithm, secret: &str) -> Vec<u8> {
        let mut writer = EncryptWriter::new(Vec::new(), algorithm, secret, ITERATIONS).unwrap();
        writer.write_all(payload).unwrap();
        writer.finish().unwrap()
    }

    fn open(sealed: &[u8], secret: &str) -> io::Result<Vec<u8>> {
        let mut reader = DecryptReader::new(sealed, secret)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip_across_frame_boundaries() {
        let payload: Vec<u8> = (0..(CHUNK_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();
        for algorithm in [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305] {
            let sealed = seal(&payload, algorithm, "correct horse");
            assert_eq!(&sealed[..4], MAGIC);
            assert_eq!(open(&sealed, "correct horse").unwrap(), payload);
        }
    }

    #[test]
    fn test_exact_chunk_multiple_and_empty_body() {
        let payload = vec![7u8; CHUNK_SIZE];
        let sealed = seal(&payload, CipherAlgorithm::Aes256Gcm, "pw");
        assert_eq!(open(&sealed, "pw").unwrap(), payload);

        let sealed = seal(b"", CipherAlgorithm::Aes256Gcm, "pw");
        assert_eq!(sealed.len(), HEADER_LEN + 1 + 4 + TAG_LEN);
        assert!(open(&sealed, "pw").unwrap().is_empty());
    }

    #[test]
    fn test_salt_makes_every_artifact_unique() {
        let a = seal(b"same payload", CipherAlgorithm::Aes256Gcm, "pw");
        let b = seal(b"same payload", CipherAlgorithm::Aes256Gcm, "pw");
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let sealed = seal(b"secret rows", CipherAlgorithm::Aes256Gcm, "right");
        let err = open(&sealed, "wrong").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncation_and_trailing_data_are_detected() {
        let payload = vec![1u8; CHUNK_SIZE + 10];
        let sealed = seal(&payload, CipherAlgorithm::Aes256Gcm, "pw");

        // Drop the final frame entirely: the body ends on a frame boundary.
        let first_frame_end = HEADER_LEN + 1 + 4 + CHUNK_SIZE + TAG_LEN;
        let err = open(&sealed[..first_frame_end], "pw").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut padded = sealed.clone();
        padded.push(0);
        let err = open(&padded, "pw").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_tampered_header_fails_authentication() {
        let mut sealed = seal(b"payload", CipherAlgorithm::Aes256Gcm, "pw");
        sealed[HEADER_LEN - 1] ^= 0xFF;
        assert!(open(&sealed, "pw").is_err());
    }

    #[test]
    fn test_invalid_key_material_is_rejected_up_front() {
        let err = EncryptWriter::new(Vec::new(), CipherAlgorithm::Aes256Gcm, "", ITERATIONS)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(EncryptWriter::new(Vec::new(), CipherAlgorithm::Aes256Gcm, "pw", 0).is_err());
        assert!(EncryptWriter::new(Vec::new(), CipherAlgorithm::Aes256Gcm, "pw", MAX_KDF_ITERATIONS + 1).is_err());
    }

    #[test]
    fn test_parse_cipher_names() {
        assert_eq!(CipherAlgorithm::parse("AES-256-GCM"), Some(CipherAlgorithm::Aes256Gcm));
        assert_eq!(
            CipherAlgorithm::parse("chacha20-poly1305"),
            Some(CipherAlgorithm::ChaCha20Poly1305)
        );
        assert_eq!(CipherAlgorithm::parse("aes-256-cbc"), None);
    }
}
