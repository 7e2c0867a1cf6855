//! Firmware images and the OAD packet format.
//!
//! An image is cut into fixed-size chunks; the last one may be short. Each chunk
//! travels as `<index u16 LE> <chunk bytes>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{DecodeError, OadFailure};

pub const OAD_INDEX_SIZE: usize = 2;

/// Indices are 16-bit and the packet count travels as a u16.
pub const MAX_PACKETS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid firmware version {0:?}, expected MAJOR.MINOR.PATCH")]
pub struct ParseVersionError(String);

impl FromStr for FirmwareVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .trim()
            .trim_start_matches(['v', 'V'])
            .split('.')
            .map(|p| p.parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParseVersionError(s.to_string()))?;

        match parts.as_slice() {
            [major, minor, patch] => Ok(FirmwareVersion::new(*major, *minor, *patch)),
            _ => Err(ParseVersionError(s.to_string())),
        }
    }
}

/// A firmware binary split into OAD packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    chunk_size: usize,
}

impl FirmwareImage {
    pub fn new(bytes: Vec<u8>, chunk_size: usize) -> Result<Self, OadFailure> {
        if bytes.is_empty() {
            return Err(OadFailure::EmptyImage);
        }
        let chunk_size = chunk_size.max(1);
        let packets = bytes.len().div_ceil(chunk_size);
        if packets > MAX_PACKETS {
            return Err(OadFailure::ImageTooLarge {
                packets,
                max: MAX_PACKETS,
            });
        }
        Ok(Self { bytes, chunk_size })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn packet_count(&self) -> usize {
        self.bytes.len().div_ceil(self.chunk_size)
    }

    pub fn chunk(&self, index: u16) -> Option<&[u8]> {
        let start = index as usize * self.chunk_size;
        if start >= self.bytes.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.bytes.len());
        Some(&self.bytes[start..end])
    }

    /// Wire form of packet `index`.
    pub fn packet(&self, index: u16) -> Option<Vec<u8>> {
        let chunk = self.chunk(index)?;
        let mut out = Vec::with_capacity(OAD_INDEX_SIZE + chunk.len());
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(chunk);
        Some(out)
    }

    pub fn packets(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        (0..self.packet_count() as u16).filter_map(move |i| self.packet(i))
    }
}

/// Rebuilds an image from OAD packets, as the device does.
///
/// Packets may arrive out of order or more than once; a repeated index simply
/// overwrites the earlier copy.
#[derive(Debug, Clone)]
pub struct Reassembler {
    chunks: Vec<Option<Vec<u8>>>,
}

impl Reassembler {
    pub fn new(packet_count: usize) -> Self {
        Self {
            chunks: vec![None; packet_count],
        }
    }

    /// Store one packet and return its index.
    pub fn accept(&mut self, packet: &[u8]) -> Result<u16, DecodeError> {
        let (index, chunk) = match packet {
            [lo, hi, chunk @ ..] => (u16::from_le_bytes([*lo, *hi]), chunk),
            _ => {
                return Err(DecodeError::InvalidLength {
                    expected: OAD_INDEX_SIZE,
                    actual: packet.len(),
                })
            }
        };
        let slot = self
            .chunks
            .get_mut(index as usize)
            .ok_or(DecodeError::InvalidLength {
                expected: OAD_INDEX_SIZE,
                actual: packet.len(),
            })?;
        *slot = Some(chunk.to_vec());
        Ok(index)
    }

    /// Indices not received yet, lowest first.
    pub fn missing(&self) -> Vec<u16> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i as u16)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    pub fn into_image(self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in self.chunks {
            out.extend_from_slice(&chunk?);
        }
        Some(out)
    }
}
