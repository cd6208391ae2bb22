//! File format definitions for saved indexes.

use crate::error::{QuiverError, Result};

/// Magic bytes identifying a quiver-ann file.
pub const MAGIC: [u8; 8] = *b"QUIVRANN";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Section type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionType {
    /// A full HNSW index: options, corpus, layers.
    HnswIndex = 1,
    /// A bare graph snapshot (ODescent output).
    GraphSnapshot = 2,
}

impl SectionType {
    /// Convert from the on-disk u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::HnswIndex),
            2 => Some(Self::GraphSnapshot),
            _ => None,
        }
    }
}

/// File header structure.
///
/// Total size: 24 bytes
/// ```text
/// [MAGIC 8B][VERSION u32][SECTION_TYPE u32][FLAGS u32][CHECKSUM u32]
/// ```
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Magic bytes (must be [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version.
    pub version: u32,
    /// Section type.
    pub section: SectionType,
    /// Reserved flag bits.
    pub flags: u32,
    /// CRC32 checksum of the data section (everything after the header).
    pub checksum: u32,
}

impl FileHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 24;

    /// Create a new header.
    pub fn new(section: SectionType, checksum: u32) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            section,
            flags: 0,
            checksum,
        }
    }

    /// Serialize the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&(self.section as u32).to_le_bytes());
        bytes[16..20].copy_from_slice(&self.flags.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(QuiverError::corrupt("header too small"));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(QuiverError::corrupt("invalid magic bytes"));
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let section_raw = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let flags = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let checksum = u32::from_le_bytes(bytes[20..24].try_into().unwrap());

        let section = SectionType::from_u32(section_raw)
            .ok_or_else(|| QuiverError::corrupt("unknown section type"))?;

        Ok(Self {
            magic,
            version,
            section,
            flags,
            checksum,
        })
    }

    /// Verify the header is supported and matches the expected section.
    pub fn verify(&self, expected: SectionType) -> Result<()> {
        if self.version > FORMAT_VERSION {
            return Err(QuiverError::corrupt(format!(
                "unsupported version {} (max supported: {})",
                self.version, FORMAT_VERSION
            )));
        }
        if self.section != expected {
            return Err(QuiverError::corrupt(format!(
                "section type mismatch: expected {:?}, got {:?}",
                expected, self.section
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader::new(SectionType::HnswIndex, 0x12345678);
        let bytes = header.to_bytes();
        let parsed = FileHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.magic, MAGIC);
        assert_eq!(parsed.version, FORMAT_VERSION);
        assert_eq!(parsed.section, SectionType::HnswIndex);
        assert_eq!(parsed.checksum, 0x12345678);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = [0u8; FileHeader::SIZE];
        bytes[0..8].copy_from_slice(b"INVALID\0");
        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_verify_section_mismatch() {
        let header = FileHeader::new(SectionType::GraphSnapshot, 0);
        assert!(header.verify(SectionType::HnswIndex).is_err());
    }

    #[test]
    fn test_section_type_from_u32() {
        assert_eq!(SectionType::from_u32(1), Some(SectionType::HnswIndex));
        assert_eq!(SectionType::from_u32(2), Some(SectionType::GraphSnapshot));
        assert_eq!(SectionType::from_u32(99), None);
    }
}
