// dumpvault/src/backup/transform.rs
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use flate2::Compression;
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use super::cipher::{CipherAlgorithm, DecryptReader, EncryptWriter};
use crate::config::Secret;
use crate::errors::{BackupError, Result};

pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Gzip { level: u32 },
    None,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Gzip { level: 6 }
    }
}

impl CompressionAlgorithm {
    fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip { .. } => ".gz",
            CompressionAlgorithm::None => "",
        }
    }
}

/// How a raw dump is turned into an artifact: compress first, then encrypt.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub compression: CompressionAlgorithm,
    pub cipher: CipherAlgorithm,
    pub secret: Secret,
    pub kdf_iterations: u32,
}

impl TransformConfig {
    /// File name suffix appended after the dump format extension.
    pub fn extension(&self) -> String {
        format!("{}.enc", self.compression.extension())
    }

    /// Wraps `sink` so that everything written is compressed, then encrypted.
    ///
    /// Fails before any byte is written if the key material is unusable.
    pub fn wrap<W: Write>(&self, sink: W) -> Result<TransformWriter<W>> {
        let encrypt = EncryptWriter::new(sink, self.cipher, self.secret.expose(), self.kdf_iterations)
            .map_err(|e| BackupError::transform(format!("cipher initialization failed: {}", e)))?;
        Ok(match self.compression {
            CompressionAlgorithm::Gzip { level } => {
                TransformWriter::Gzip(GzEncoder::new(encrypt, Compression::new(level.min(9))))
            }
            CompressionAlgorithm::None => TransformWriter::Plain(encrypt),
        })
    }

    /// Inverse of [`wrap`](Self::wrap): decrypts, then decompresses.
    ///
    /// The reader only reports EOF once the encrypted stream itself ended cleanly, so a missing
    /// final frame or trailing bytes are errors even when the gzip trailer was already read.
    pub fn open<'a, R: Read + 'a>(&self, source: R) -> io::Result<Box<dyn Read + 'a>> {
        let decrypt = DecryptReader::new(source, self.secret.expose())?;
        Ok(match self.compression {
            CompressionAlgorithm::Gzip { .. } => Box::new(GzipArtifactReader {
                decoder: GzDecoder::new(BufReader::new(decrypt)),
                drained: false,
            }),
            CompressionAlgorithm::None => Box::new(decrypt),
        })
    }
}

struct GzipArtifactReader<R: Read> {
    decoder: GzDecoder<BufReader<DecryptReader<R>>>,
    drained: bool,
}

impl<R: Read> Read for GzipArtifactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.decoder.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.drained {
            // bufread::GzDecoder consumes nothing past the gzip trailer.
            let rest = io::copy(self.decoder.get_mut(), &mut io::sink())?;
            if rest != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} unexpected bytes after the compressed stream", rest),
                ));
            }
            self.drained = true;
        }
        Ok(n)
    }
}

pub enum TransformWriter<W: Write> {
    Gzip(GzEncoder<EncryptWriter<W>>),
    Plain(EncryptWriter<W>),
}

impl<W: Write> TransformWriter<W> {
    /// Flushes the compressor, seals the final cipher frame and hands back the sink.
    pub fn finish(self) -> io::Result<W> {
        match self {
            TransformWriter::Gzip(gz) => gz.finish()?.finish(),
            TransformWriter::Plain(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for TransformWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TransformWriter::Gzip(gz) => gz.write(buf),
            TransformWriter::Plain(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TransformWriter::Gzip(gz) => gz.flush(),
            TransformWriter::Plain(enc) => enc.flush(),
        }
    }
}

/// Buffered file sink that counts and digests everything written to disk.
pub struct ArtifactWriter {
    file: BufWriter<File>,
    hasher: Sha256,
    written: u64,
}

/// What ended up on disk once the artifact was sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedArtifact {
    pub size_bytes: u64,
    pub sha256: String,
}

impl ArtifactWriter {
    pub fn new(file: File) -> Self {
        Self {
            file: BufWriter::new(file),
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Flushes and fsyncs the file. The handle is closed when this returns.
    pub fn seal(self) -> io::Result<SealedArtifact> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(SealedArtifact {
            size_bytes: self.written,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::cipher::CHUNK_SIZE;

    fn config(compression: CompressionAlgorithm) -> TransformConfig {
        TransformConfig {
            compression,
            cipher: CipherAlgorithm::Aes256Gcm,
            secret: Secret::new("backup-password"),
            kdf_iterations: 1_000,
        }
    }

    #[test]
    fn test_compress_encrypt_round_trip() {
        let payload = b"PGDMP custom archive \x00\x01\x02 ".repeat(10_000);
        for compression in [CompressionAlgorithm::default(), CompressionAlgorithm::None] {
            let config = config(compression);
            let mut writer = config.wrap(Vec::new()).unwrap();
            writer.write_all(&payload).unwrap();
            let artifact = writer.finish().unwrap();

            let mut restored = Vec::new();
            config.open(artifact.as_slice()).unwrap().read_to_end(&mut restored).unwrap();
            assert_eq!(restored, payload);
        }
    }

    /// Stored (level 0) gzip size of `payload_len` bytes of input.
    fn stored_gzip_len(payload_len: usize) -> usize {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Compression::new(0));
        encoder.write_all(&vec![42u8; payload_len]).unwrap();
        encoder.finish().unwrap().len()
    }

    #[test]
    fn test_damage_is_detected_when_gzip_ends_on_a_frame_boundary() {
        // Pick a payload whose gzip stream fills exactly one cipher frame, so the gzip trailer
        // is in a non-final frame and the final frame carries no plaintext.
        let payload_len = (65_000..CHUNK_SIZE)
            .find(|len| stored_gzip_len(*len) == CHUNK_SIZE)
            .expect("a stored gzip stream of exactly one frame");
        let config = config(CompressionAlgorithm::Gzip { level: 0 });
        let payload = vec![42u8; payload_len];
        let mut writer = config.wrap(Vec::new()).unwrap();
        writer.write_all(&payload).unwrap();
        let artifact = writer.finish().unwrap();

        let read_all = |bytes: &[u8]| -> io::Result<Vec<u8>> {
            let mut out = Vec::new();
            config.open(bytes)?.read_to_end(&mut out)?;
            Ok(out)
        };

        assert_eq!(read_all(&artifact[..]).unwrap(), payload);

        let empty_final_frame = 1 + 4 + 16;
        let truncated = &artifact[..artifact.len() - empty_final_frame];
        assert!(read_all(truncated).is_err());

        let mut padded = artifact.clone();
        padded.push(0);
        assert!(read_all(&padded[..]).is_err());
    }

    #[test]
    fn test_compression_happens_before_encryption() {
        let payload = vec![b'a'; 512 * 1024];
        let gz = config(CompressionAlgorithm::default());
        let mut writer = gz.wrap(Vec::new()).unwrap();
        writer.write_all(&payload).unwrap();
        let compressed = writer.finish().unwrap();
        assert!(compressed.len() < payload.len() / 10);
    }

    #[test]
    fn test_empty_secret_fails_before_writing() {
        let mut config = config(CompressionAlgorithm::default());
        config.secret = Secret::new("");
        match config.wrap(Vec::new()) {
            Err(BackupError::TransformFailed { cause }) => {
                assert!(cause.contains("cipher initialization failed"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("wrap should reject an empty secret"),
        }
    }

    #[test]
    fn test_extension_follows_compression() {
        assert_eq!(config(CompressionAlgorithm::default()).extension(), ".gz.enc");
        assert_eq!(config(CompressionAlgorithm::None).extension(), ".enc");
    }

    #[test]
    fn test_artifact_writer_counts_and_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        let mut writer = ArtifactWriter::new(File::create(&path).unwrap());
        writer.write_all(b"abc").unwrap();
        let sealed = writer.seal().unwrap();

        assert_eq!(sealed.size_bytes, 3);
        assert_eq!(
            sealed.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
