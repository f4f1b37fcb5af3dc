use std::ops::Range;

use crate::codec::read_u16;
use crate::error::{BrambleError, Result};

/// Size of the reserved header region at the start of the file.
pub const METADATA_SIZE: usize = 1000;

const PAGE_SIZE_FIELD: Range<usize> = 0..2;
const CUSTOM_LEN_FIELD: Range<usize> = 500..502;

/// Maximum custom-metadata payload: the slot minus its 2-byte length prefix.
pub const MAX_CUSTOM_METADATA_SIZE: usize = METADATA_SIZE - CUSTOM_LEN_FIELD.end;

/// The reserved file header: the page size the file was created with, plus a
/// small slot of application-owned bytes (the tree persists its metadata
/// there). A zero-length custom payload reads back as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub page_size: u16,
    pub custom: Option<Vec<u8>>,
}

impl Metadata {
    pub fn new(page_size: u16) -> Self {
        Self {
            page_size,
            custom: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; METADATA_SIZE];
        data[PAGE_SIZE_FIELD].copy_from_slice(&self.page_size.to_be_bytes());
        if let Some(custom) = &self.custom {
            data[CUSTOM_LEN_FIELD].copy_from_slice(&(custom.len() as u16).to_be_bytes());
            data[CUSTOM_LEN_FIELD.end..CUSTOM_LEN_FIELD.end + custom.len()]
                .copy_from_slice(custom);
        }
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < METADATA_SIZE {
            return Err(BrambleError::Corrupt(format!(
                "metadata header is {} bytes, expected {METADATA_SIZE}",
                data.len()
            )));
        }
        let page_size = read_u16(data, PAGE_SIZE_FIELD.start)?;
        let custom_len = read_u16(data, CUSTOM_LEN_FIELD.start)? as usize;
        if custom_len > MAX_CUSTOM_METADATA_SIZE {
            return Err(BrambleError::Corrupt(format!(
                "custom metadata length {custom_len} exceeds slot of {MAX_CUSTOM_METADATA_SIZE}"
            )));
        }
        let custom = if custom_len == 0 {
            None
        } else {
            Some(data[CUSTOM_LEN_FIELD.end..CUSTOM_LEN_FIELD.end + custom_len].to_vec())
        };
        Ok(Self { page_size, custom })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_custom() {
        let metadata = Metadata::new(4096);
        let encoded = metadata.encode();
        assert_eq!(encoded.len(), METADATA_SIZE);
        assert_eq!(Metadata::decode(&encoded).unwrap(), metadata);
    }

    #[test]
    fn roundtrip_with_custom() {
        let metadata = Metadata {
            page_size: 64,
            custom: Some(vec![1, 2, 3, 4, 5]),
        };
        assert_eq!(Metadata::decode(&metadata.encode()).unwrap(), metadata);
    }

    #[test]
    fn roundtrip_with_full_slot() {
        let metadata = Metadata {
            page_size: 4096,
            custom: Some(vec![0xAB; MAX_CUSTOM_METADATA_SIZE]),
        };
        assert_eq!(Metadata::decode(&metadata.encode()).unwrap(), metadata);
    }

    #[test]
    fn short_header_is_corrupt() {
        assert!(Metadata::decode(&[0; METADATA_SIZE - 1]).is_err());
    }
}
