//! Bit-exact little-endian serialization for the content-addressed build
//! header: a fixed metadata record followed by an ordered run of
//! `buildMap` records to EOF.
//!
//! Byte ranges are spelled out explicitly with `to_le_bytes`/`from_le_bytes`
//! rather than going through a binary-serde crate, since the on-disk layout
//! is a fixed C-style struct rather than something to hand to serde.

use uuid::Uuid;

use crate::error::{BlockDeviceError, Result};

pub const CURRENT_VERSION: i64 = 1;

const METADATA_LEN: usize = 8 + 8 + 8 + 16;
const BUILD_MAP_LEN: usize = 8 + 8 + 16 + 8;

/// Fixed-size metadata record at offset 0 of a build header file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMetadata {
    pub version: i64,
    pub block_size: i64,
    pub size: i64,
    pub build_id: Uuid,
}

impl BuildMetadata {
    fn to_bytes(&self) -> [u8; METADATA_LEN] {
        let mut buf = [0u8; METADATA_LEN];
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        // UUID bytes are big-endian per RFC 4122 regardless of the
        // surrounding header's little-endian integer fields.
        buf[24..40].copy_from_slice(self.build_id.as_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_LEN {
            return Err(BlockDeviceError::HeaderMalformed(
                "truncated metadata record".into(),
            ));
        }
        let version = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        if version != CURRENT_VERSION {
            return Err(BlockDeviceError::HeaderMalformed(format!(
                "unknown header version {}",
                version
            )));
        }
        let block_size = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let size = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&buf[24..40]);
        let build_id = Uuid::from_bytes(id_bytes);
        Ok(Self {
            version,
            block_size,
            size,
            build_id,
        })
    }
}

/// One entry of the ordered mapping table: the logical range
/// `[offset, offset + length)` is supplied by `length` bytes of
/// `source_build_id`'s data starting at `source_storage_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMap {
    pub offset: u64,
    pub length: u64,
    pub source_build_id: Uuid,
    pub source_storage_offset: u64,
}

impl BuildMap {
    fn to_bytes(&self) -> [u8; BUILD_MAP_LEN] {
        let mut buf = [0u8; BUILD_MAP_LEN];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..32].copy_from_slice(self.source_build_id.as_bytes());
        buf[32..40].copy_from_slice(&self.source_storage_offset.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUILD_MAP_LEN {
            return Err(BlockDeviceError::HeaderMalformed(
                "short buildMap record".into(),
            ));
        }
        let offset = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let length = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&buf[16..32]);
        let source_build_id = Uuid::from_bytes(id_bytes);
        let source_storage_offset = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        Ok(Self {
            offset,
            length,
            source_build_id,
            source_storage_offset,
        })
    }
}

/// A fully deserialized header: metadata plus its ordered mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildHeader {
    pub metadata: BuildMetadata,
    pub mappings: Vec<BuildMap>,
}

impl BuildHeader {
    pub fn new(metadata: BuildMetadata, mappings: Vec<BuildMap>) -> Self {
        Self { metadata, mappings }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_LEN + self.mappings.len() * BUILD_MAP_LEN);
        out.extend_from_slice(&self.metadata.to_bytes());
        for m in &self.mappings {
            out.extend_from_slice(&m.to_bytes());
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let metadata = BuildMetadata::from_bytes(buf)?;
        let mut mappings = Vec::new();
        let mut pos = METADATA_LEN;
        while pos < buf.len() {
            let remaining = buf.len() - pos;
            if remaining < BUILD_MAP_LEN {
                return Err(BlockDeviceError::HeaderMalformed(format!(
                    "short final buildMap record: {} bytes remaining, need {}",
                    remaining, BUILD_MAP_LEN
                )));
            }
            let m = BuildMap::from_bytes(&buf[pos..pos + BUILD_MAP_LEN])?;
            mappings.push(m);
            pos += BUILD_MAP_LEN;
        }
        Ok(Self { metadata, mappings })
    }

    /// Finds the mapping covering `offset` and the shift into it.
    /// Mappings are sorted ascending and non-overlapping, so a binary
    /// search on `offset` is sufficient.
    pub fn get_mapping(&self, offset: u64) -> Result<(&BuildMap, u64)> {
        let idx = self
            .mappings
            .partition_point(|m| m.offset + m.length <= offset);
        match self.mappings.get(idx) {
            Some(m) if m.offset <= offset && offset < m.offset + m.length => {
                Ok((m, offset - m.offset))
            }
            _ => Err(BlockDeviceError::Eof),
        }
    }

    /// Verifies the mapping table covers `[0, size)` with no gaps or
    /// overlaps, ascending by offset. The builder that emits a header is
    /// responsible for this invariant; this is the reader-side check.
    pub fn validate_coverage(&self) -> Result<()> {
        let mut expected = 0u64;
        for m in &self.mappings {
            if m.offset != expected {
                return Err(BlockDeviceError::HeaderMalformed(format!(
                    "gap or overlap at offset {}, expected {}",
                    m.offset, expected
                )));
            }
            expected += m.length;
        }
        if expected != self.metadata.size as u64 {
            return Err(BlockDeviceError::HeaderMalformed(format!(
                "mappings cover {} bytes, header declares size {}",
                expected, self.metadata.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BuildHeader {
        let build_id = Uuid::from_bytes([1u8; 16]);
        let b1 = Uuid::from_bytes([2u8; 16]);
        let b2 = Uuid::from_bytes([3u8; 16]);
        BuildHeader::new(
            BuildMetadata {
                version: CURRENT_VERSION,
                block_size: 4096,
                size: 1_048_576,
                build_id,
            },
            vec![
                BuildMap {
                    offset: 0,
                    length: 524_288,
                    source_build_id: b1,
                    source_storage_offset: 0,
                },
                BuildMap {
                    offset: 524_288,
                    length: 524_288,
                    source_build_id: b2,
                    source_storage_offset: 1_048_576,
                },
            ],
        )
    }

    #[test]
    fn round_trips_through_serialize_deserialize() {
        let header = sample_header();
        let bytes = header.serialize();
        let decoded = BuildHeader::deserialize(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn get_mapping_resolves_offset_and_shift() {
        let header = sample_header();
        let (m, shift) = header.get_mapping(600_000).unwrap();
        assert_eq!(m.offset, 524_288);
        assert_eq!(shift, 600_000 - 524_288);
    }

    #[test]
    fn get_mapping_past_end_is_eof() {
        let header = sample_header();
        let err = header.get_mapping(2_000_000).unwrap_err();
        assert!(matches!(err, BlockDeviceError::Eof));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample_header().serialize();
        bytes[0..8].copy_from_slice(&99i64.to_le_bytes());
        let err = BuildHeader::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, BlockDeviceError::HeaderMalformed(_)));
    }

    #[test]
    fn rejects_short_final_record() {
        let mut bytes = sample_header().serialize();
        bytes.truncate(bytes.len() - 3);
        let err = BuildHeader::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, BlockDeviceError::HeaderMalformed(_)));
    }

    #[test]
    fn validate_coverage_accepts_contiguous_mappings() {
        assert!(sample_header().validate_coverage().is_ok());
    }

    #[test]
    fn validate_coverage_rejects_gap() {
        let mut header = sample_header();
        header.mappings[1].offset += 4096;
        assert!(header.validate_coverage().is_err());
    }
}
