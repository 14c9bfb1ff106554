use std::fmt;
use std::io::Read;
use std::str;
use std::str::FromStr;

use anyhow::{Context, Result, ensure};
use data_encoding::{Encoding, HEXLOWER_PERMISSIVE};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// A SHA-256 content hash, serialized as 64 lowercase hex characters.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum([u8; 32]);

impl Checksum {
    const ENCODING: Encoding = HEXLOWER_PERMISSIVE;

    pub fn parse(s: &str) -> Result<Self> {
        fn inner(s: &str) -> Result<Checksum> {
            let mut buffer = [0u8; 32];
            let expected_len = buffer.len();

            let decode_len = Checksum::ENCODING.decode_len(s.len())?;
            ensure!(
                decode_len == expected_len,
                "invalid checksum length {decode_len}, should be {expected_len}"
            );

            let len = Checksum::ENCODING
                .decode_mut(s.as_bytes(), &mut buffer)
                .map_err(|e| e.error)?;
            ensure!(
                len == expected_len,
                "invalid checksum length {len}, should be {expected_len}"
            );

            Ok(Checksum(buffer))
        }

        inner(s).with_context(|| format!("failed to parse checksum: {s}"))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checksum::parse(s)
    }
}

impl TryFrom<&str> for Checksum {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<String> for Checksum {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buffer = [0u8; 64];
        Checksum::ENCODING.encode_mut(&self.0, &mut buffer);
        // SAFETY: We just generated this hexadecimal string.
        let string = unsafe { str::from_utf8_unchecked(&buffer) };
        f.write_str(string)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

/// A running SHA-256 computation.
pub struct Digest(sha2::Sha256);

impl Digest {
    pub fn new() -> Self {
        Self(sha2::Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn update_read(&mut self, mut input: impl Read) -> Result<&mut Self> {
        let mut buf = [0; 64 * 1024];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break Ok(self);
            }
            self.update(&buf[..n]);
        }
    }

    pub fn finish(&mut self) -> Checksum {
        Checksum(self.0.finalize_reset().into())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::new()
    }
}

/// A running CRC-32C (Castagnoli) computation, as used by the archive host's
/// `x-goog-hash` integrity header.
pub struct Crc32c {
    state: u32,
}

const CRC32C_POLY: u32 = 0x82f63b78;

static CRC32C_TABLE: once_cell::sync::Lazy<[u32; 256]> = once_cell::sync::Lazy::new(|| {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
});

impl Crc32c {
    pub fn new() -> Self {
        Self { state: !0 }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            let index = ((self.state ^ byte as u32) & 0xff) as usize;
            self.state = (self.state >> 8) ^ CRC32C_TABLE[index];
        }
        self
    }

    pub fn finish(&self) -> u32 {
        !self.state
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}
