//! SHA-256 content verification.
//!
//! Streaming adapters compute digests while data flows through them, so
//! layers are hashed in the same pass that compresses or extracts them.

use std::io::{Read, Write};
use std::path::Path;

use recast_common::error::{RecastError, Result};
use recast_common::types::Digest;
use sha2::{Digest as _, Sha256};

/// Computes the SHA-256 digest of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Digest> {
    tracing::debug!(path = %path.display(), "computing SHA-256 digest");
    let file = std::fs::File::open(path).map_err(|e| RecastError::io(path, e))?;
    let mut reader = HashingReader::new(file);
    let _ = std::io::copy(&mut reader, &mut std::io::sink()).map_err(|e| RecastError::io(path, e))?;
    Ok(reader.digest())
}

/// Validates that a file matches the expected digest.
///
/// # Errors
///
/// Returns `RecastError::HashMismatch` if the digests differ.
pub fn validate_hash(path: &Path, expected: &Digest) -> Result<()> {
    let actual = hash_file(path)?;
    if &actual != expected {
        return Err(RecastError::HashMismatch {
            resource: path.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Writer adapter that hashes and counts everything written through it.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Number of bytes written so far.
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Returns the inner writer together with the digest and byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that hashes everything read through it.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    /// Number of bytes read so far.
    pub const fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Digest of the bytes read so far.
    pub fn digest(&self) -> Digest {
        Digest::from_hasher(self.hasher.clone())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_file_matches_in_memory_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello layer").expect("write");
        assert_eq!(hash_file(&path).expect("hash"), Digest::from_bytes(b"hello layer"));
    }

    #[test]
    fn validate_hash_reports_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        std::fs::write(&path, b"actual").expect("write");
        let err = validate_hash(&path, &Digest::from_bytes(b"expected")).unwrap_err();
        assert!(matches!(err, RecastError::HashMismatch { .. }));
    }

    #[test]
    fn hashing_writer_counts_and_hashes() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"abc").expect("write");
        w.write_all(b"def").expect("write");
        let (inner, digest, n) = w.finish();
        assert_eq!(inner, b"abcdef");
        assert_eq!(n, 6);
        assert_eq!(digest, Digest::from_bytes(b"abcdef"));
    }

    #[test]
    fn hashing_reader_tracks_partial_reads() {
        let mut r = HashingReader::new(&b"0123456789"[..]);
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).expect("read");
        assert_eq!(r.bytes_read(), 4);
        assert_eq!(r.digest(), Digest::from_bytes(b"0123"));
    }
}
