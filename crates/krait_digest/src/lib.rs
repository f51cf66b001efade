#![deny(missing_docs)]

//! Checksum helpers shared by the krait crates.
//!
//! Packages and index files are identified by MD5 and SHA-256 digests. This
//! crate wraps the `RustCrypto` hash implementations with the small set of
//! operations the rest of the workspace needs: computing a digest from a file
//! or byte slice, parsing the hex representation found in `repodata.json`,
//! and a [`HashingWriter`]/[`HashingReader`] pair that digests data as it
//! streams through.

pub mod serde;

use std::{fs::File, io::Write, path::Path};

pub use digest::{Digest, Output};
pub use md5::Md5;
pub use sha2::Sha256;

/// The output of an MD5 digest.
pub type Md5Hash = Output<Md5>;

/// The output of a SHA-256 digest.
pub type Sha256Hash = Output<Sha256>;

/// Computes the digest of a file on disk.
pub fn compute_file_digest<D: Digest + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Computes the digest of the given bytes.
pub fn compute_bytes_digest<D: Digest>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hex encoded digest, e.g. `d41d8cd98f00b204e9800998ecf8427e`.
/// Returns `None` if the string is not valid hex or has the wrong length.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = Output::<D>::default();
    match hex::decode_to_slice(str, &mut hash) {
        Ok(_) => Some(hash),
        Err(_) => None,
    }
}

/// A writer that forwards all data to an inner writer while computing a digest
/// of the bytes that passed through.
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

impl<W, D: Digest + Default> HashingWriter<W, D> {
    /// Constructs a new instance from a writer and a new (empty) hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: D::default(),
        }
    }

    /// Consumes this instance and returns the inner writer and the digest of
    /// all written bytes.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A reader that computes a digest of the bytes that are read from it.
pub struct HashingReader<R, D: Digest> {
    reader: R,
    hasher: D,
}

impl<R, D: Digest + Default> HashingReader<R, D> {
    /// Constructs a new instance from a reader and a new (empty) hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: D::default(),
        }
    }

    /// Consumes this instance and returns the inner reader and the digest of
    /// all bytes read.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.reader, self.hasher.finalize())
    }
}

impl<R: std::io::Read, D: Digest> std::io::Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}
