//! XOR-fold fingerprints for change detection
//!
//! Every input byte is folded into the digest position `index % block_size`.
//! This is a cheap change detector, not a content address: two files of
//! different length can collide, so callers always pair it with a size check.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::error::{Result, SyncError};
use crate::protocol::BLOCK_SIZE;

/// Upper bound (exclusive) for a configurable block size
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Streaming fingerprint state
pub struct Hasher {
    digest: Vec<u8>,
    index: usize,
}

impl Hasher {
    pub fn new(block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            digest: vec![0u8; block_size],
            index: 0,
        })
    }

    /// Fold more bytes into the digest, continuing where the last call stopped
    pub fn update(&mut self, data: &[u8]) {
        let block_size = self.digest.len();
        for &byte in data {
            self.digest[self.index] ^= byte;
            self.index += 1;
            if self.index == block_size {
                self.index = 0;
            }
        }
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.digest)
    }
}

fn validate_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size >= MAX_BLOCK_SIZE {
        return Err(SyncError::InvalidBlockSize {
            got: block_size,
            max: MAX_BLOCK_SIZE - 1,
        });
    }
    Ok(())
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// All-zero fingerprint; tree snapshots use it for files they cannot read
    pub fn zeroed(block_size: usize) -> Self {
        Self(vec![0u8; block_size])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Read `reader` to completion and fold it into a fingerprint
    pub fn compute<R: Read>(mut reader: R, block_size: usize) -> io::Result<Self> {
        let mut hasher = Hasher::new(block_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finish())
    }

    /// Fingerprint a file with the protocol block size
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::compute(BufReader::new(file), BLOCK_SIZE)
    }

    /// Parse a hex string. Shorter input is zero-extended to `block_size`.
    pub fn from_hex(s: &str, block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        if s.len() > block_size * 2 {
            return Err(SyncError::Protocol(format!(
                "hash {s:?} is longer than {} hex digits",
                block_size * 2
            )));
        }
        if !s.is_ascii() {
            return Err(SyncError::Protocol(format!("invalid hex hash {s:?}")));
        }
        // A lone trailing digit is the low nibble of the last byte
        let padded = if s.len() % 2 == 1 {
            let (head, last) = s.split_at(s.len() - 1);
            format!("{head}0{last}")
        } else {
            s.to_string()
        };
        let mut bytes = hex::decode(&padded)
            .map_err(|e| SyncError::Protocol(format!("invalid hex hash {s:?}: {e}")))?;
        bytes.resize(block_size, 0);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Index of the first position where the two fingerprints differ.
    /// `None` when they match over the length of the shorter one.
    pub fn first_difference(&self, other: &Fingerprint) -> Option<usize> {
        self.0.iter().zip(other.0.iter()).position(|(a, b)| a != b)
    }

    /// Space-separated hex bytes, the format printed by `treesync hash`
    pub fn to_spaced_hex(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0))
    }
}

/// Decide whether two files with known sizes and computed fingerprints hold
/// the same content. Empty files always match.
pub fn same_content(
    size_a: u64,
    fp_a: &Fingerprint,
    size_b: u64,
    fp_b: &Fingerprint,
) -> bool {
    if size_a != size_b {
        return false;
    }
    if size_a == 0 {
        return true;
    }
    fp_a == fp_b
}
