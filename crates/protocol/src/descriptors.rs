//! FunctionFS descriptor and string blobs
//!
//! Both blobs are written to endpoint 0 exactly once, descriptors first,
//! before the gadget is enabled. All multi-byte fields are little-endian.
//!
//! # Descriptor blob
//!
//! ```text
//! magic (u32) | length (u32) | flags (u32)
//! fs_count (u32) | hs_count (u32) | ss_count (u32)
//! per speed: interface descriptor, then for each pipe IN + OUT endpoint descriptors
//! ```
//!
//! # String blob
//!
//! ```text
//! magic (u32) | length (u32) | str_count (u32) | lang_count (u32)
//! lang (u16) | NUL-terminated name
//! ```

use crate::error::{ProtocolError, Result};
use crate::pipe::{MAX_PIPE_COUNT, PIPE_COUNT, USB_DIR_IN};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const FUNCTIONFS_DESCRIPTORS_MAGIC_V2: u32 = 3;
pub const FUNCTIONFS_STRINGS_MAGIC: u32 = 2;

pub const FUNCTIONFS_HAS_FS_DESC: u32 = 1;
pub const FUNCTIONFS_HAS_HS_DESC: u32 = 2;
pub const FUNCTIONFS_HAS_SS_DESC: u32 = 4;

pub const USB_DT_INTERFACE: u8 = 0x04;
pub const USB_DT_ENDPOINT: u8 = 0x05;
pub const USB_ENDPOINT_XFER_BULK: u8 = 0x02;
pub const USB_CLASS_COMM: u8 = 0x02;

pub const INTERFACE_DESC_SIZE: u8 = 9;
/// Endpoint descriptor without the audio-only fields
pub const ENDPOINT_DESC_SIZE: u8 = 7;

pub const LANG_ID_EN_US: u16 = 0x0409;

/// Name published in the single string descriptor
pub const INTERFACE_NAME: &str = "IIO";

const HEADER_SIZE: usize = 12;
const COUNTS_SIZE: usize = 12;
const STRINGS_HEADER_SIZE: usize = 16;
const MAX_STRING_LEN: usize = 126;

/// Bus speed class a descriptor section is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Full,
    High,
    Super,
}

impl SpeedClass {
    /// All speed classes in blob order
    pub const ALL: [SpeedClass; 3] = [SpeedClass::Full, SpeedClass::High, SpeedClass::Super];

    /// Bulk wMaxPacketSize for this speed class
    pub fn max_packet_size(self) -> u16 {
        match self {
            SpeedClass::Full => 64,
            SpeedClass::High | SpeedClass::Super => 512,
        }
    }
}

/// Descriptor and string blobs for one FunctionFS instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptors {
    pub descriptors: Vec<u8>,
    pub strings: Vec<u8>,
}

impl FunctionDescriptors {
    /// Blobs for the default pipe count and interface name
    pub fn build() -> Result<Self> {
        Self::with_pipes(PIPE_COUNT, INTERFACE_NAME)
    }

    /// Blobs for an explicit pipe count and interface name
    pub fn with_pipes(pipe_count: usize, name: &str) -> Result<Self> {
        Ok(Self {
            descriptors: descriptor_blob(pipe_count)?,
            strings: string_blob(name)?,
        })
    }
}

/// Number of descriptors in one speed section (interface + endpoints)
fn descriptors_per_speed(pipe_count: usize) -> u32 {
    (pipe_count * 2 + 1) as u32
}

fn section_size(pipe_count: usize) -> usize {
    INTERFACE_DESC_SIZE as usize + pipe_count * 2 * ENDPOINT_DESC_SIZE as usize
}

/// Build the descriptor blob for `pipe_count` pipes
pub fn descriptor_blob(pipe_count: usize) -> Result<Vec<u8>> {
    if pipe_count == 0 || pipe_count > MAX_PIPE_COUNT {
        return Err(ProtocolError::InvalidPipeCount {
            count: pipe_count,
            max: MAX_PIPE_COUNT,
        });
    }

    let length = HEADER_SIZE + COUNTS_SIZE + SpeedClass::ALL.len() * section_size(pipe_count);
    let mut blob = Vec::with_capacity(length);

    blob.write_u32::<LittleEndian>(FUNCTIONFS_DESCRIPTORS_MAGIC_V2)?;
    blob.write_u32::<LittleEndian>(length as u32)?;
    blob.write_u32::<LittleEndian>(
        FUNCTIONFS_HAS_FS_DESC | FUNCTIONFS_HAS_HS_DESC | FUNCTIONFS_HAS_SS_DESC,
    )?;
    for _ in SpeedClass::ALL {
        blob.write_u32::<LittleEndian>(descriptors_per_speed(pipe_count))?;
    }

    for speed in SpeedClass::ALL {
        write_section(&mut blob, pipe_count, speed)?;
    }

    debug_assert_eq!(blob.len(), length);
    Ok(blob)
}

fn write_section(blob: &mut Vec<u8>, pipe_count: usize, speed: SpeedClass) -> Result<()> {
    // Interface descriptor
    blob.write_u8(INTERFACE_DESC_SIZE)?;
    blob.write_u8(USB_DT_INTERFACE)?;
    blob.write_u8(0)?; // bInterfaceNumber
    blob.write_u8(0)?; // bAlternateSetting
    blob.write_u8((pipe_count * 2) as u8)?;
    blob.write_u8(USB_CLASS_COMM)?;
    blob.write_u8(0)?; // bInterfaceSubClass
    blob.write_u8(0)?; // bInterfaceProtocol
    blob.write_u8(1)?; // iInterface

    for i in 0..pipe_count as u8 {
        write_bulk_endpoint(blob, USB_DIR_IN | (i * 2 + 1), speed.max_packet_size())?;
        write_bulk_endpoint(blob, i * 2 + 2, speed.max_packet_size())?;
    }

    Ok(())
}

fn write_bulk_endpoint(blob: &mut Vec<u8>, address: u8, max_packet_size: u16) -> Result<()> {
    blob.write_u8(ENDPOINT_DESC_SIZE)?;
    blob.write_u8(USB_DT_ENDPOINT)?;
    blob.write_u8(address)?;
    blob.write_u8(USB_ENDPOINT_XFER_BULK)?;
    blob.write_u16::<LittleEndian>(max_packet_size)?;
    blob.write_u8(0)?; // bInterval
    Ok(())
}

/// Build the string blob: one language, one string
pub fn string_blob(name: &str) -> Result<Vec<u8>> {
    if name.len() > MAX_STRING_LEN {
        return Err(ProtocolError::NameTooLong {
            len: name.len(),
            max: MAX_STRING_LEN,
        });
    }

    let length = STRINGS_HEADER_SIZE + 2 + name.len() + 1;
    let mut blob = Vec::with_capacity(length);

    blob.write_u32::<LittleEndian>(FUNCTIONFS_STRINGS_MAGIC)?;
    blob.write_u32::<LittleEndian>(length as u32)?;
    blob.write_u32::<LittleEndian>(1)?; // str_count
    blob.write_u32::<LittleEndian>(1)?; // lang_count
    blob.write_u16::<LittleEndian>(LANG_ID_EN_US)?;
    blob.write_all(name.as_bytes())?;
    blob.write_u8(0)?;

    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_blob_length() {
        let blob = descriptor_blob(PIPE_COUNT).unwrap();
        // header + counts + 3 * (interface + 6 endpoints)
        assert_eq!(blob.len(), 12 + 12 + 3 * (9 + 6 * 7));
        assert_eq!(&blob[4..8], &(blob.len() as u32).to_le_bytes());
    }

    #[test]
    fn test_descriptor_header() {
        let blob = descriptor_blob(PIPE_COUNT).unwrap();
        assert_eq!(&blob[0..4], &3u32.to_le_bytes());
        assert_eq!(&blob[8..12], &7u32.to_le_bytes());
        for count in blob[12..24].chunks(4) {
            assert_eq!(count, &7u32.to_le_bytes());
        }
    }

    #[test]
    fn test_full_speed_section() {
        let blob = descriptor_blob(PIPE_COUNT).unwrap();
        let section = &blob[24..24 + 51];

        assert_eq!(&section[0..2], &[INTERFACE_DESC_SIZE, USB_DT_INTERFACE]);
        assert_eq!(section[4], 6);
        assert_eq!(section[5], USB_CLASS_COMM);
        assert_eq!(section[8], 1);

        let endpoints: Vec<_> = section[9..].chunks(7).collect();
        assert_eq!(endpoints.len(), 6);
        assert_eq!(endpoints[0], &[7, USB_DT_ENDPOINT, 0x81, 0x02, 64, 0, 0]);
        assert_eq!(endpoints[1], &[7, USB_DT_ENDPOINT, 0x02, 0x02, 64, 0, 0]);
        assert_eq!(endpoints[4][2], 0x85);
        assert_eq!(endpoints[5][2], 0x06);
    }

    #[test]
    fn test_high_and_super_speed_packet_size() {
        let blob = descriptor_blob(PIPE_COUNT).unwrap();
        let hs_first_ep = 24 + 51 + 9;
        let ss_first_ep = 24 + 2 * 51 + 9;
        assert_eq!(&blob[hs_first_ep + 4..hs_first_ep + 6], &512u16.to_le_bytes());
        assert_eq!(&blob[ss_first_ep + 4..ss_first_ep + 6], &512u16.to_le_bytes());
    }

    #[test]
    fn test_descriptor_blob_is_deterministic() {
        assert_eq!(descriptor_blob(3).unwrap(), descriptor_blob(3).unwrap());
        assert_ne!(descriptor_blob(2).unwrap(), descriptor_blob(3).unwrap());
    }

    #[test]
    fn test_invalid_pipe_counts() {
        assert!(descriptor_blob(0).is_err());
        assert!(descriptor_blob(MAX_PIPE_COUNT + 1).is_err());
        assert!(descriptor_blob(MAX_PIPE_COUNT).is_ok());
    }

    #[test]
    fn test_string_blob() {
        let blob = string_blob("IIO").unwrap();
        assert_eq!(blob.len(), 22);
        assert_eq!(&blob[0..4], &2u32.to_le_bytes());
        assert_eq!(&blob[4..8], &22u32.to_le_bytes());
        assert_eq!(&blob[16..18], &0x0409u16.to_le_bytes());
        assert_eq!(&blob[18..], b"IIO\0");
    }

    #[test]
    fn test_string_blob_name_too_long() {
        let name = "x".repeat(200);
        assert!(matches!(
            string_blob(&name),
            Err(ProtocolError::NameTooLong { len: 200, .. })
        ));
    }
}
