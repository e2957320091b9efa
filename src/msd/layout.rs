//! Raw image layout probe
//!
//! The image is either an MBR disk with one FAT32 partition, or (degraded
//! mode) a bare FAT32 filesystem. Tools that read the raw image need to
//! know where the filesystem starts.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{AppError, Result};

/// Sector size in bytes
pub const SECTOR_SIZE: u64 = 512;

/// Partition start used when creating the image (1 MiB aligned)
pub const PARTITION_START: &str = "1MiB";

const BOOT_SIGNATURE_OFFSET: usize = 510;
const FAT32_FS_TYPE_OFFSET: usize = 82;
const FAT32_FS_TYPE: &[u8; 8] = b"FAT32   ";
const MBR_PARTITION_TABLE_OFFSET: usize = 446;

/// Where the FAT32 filesystem lives inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    /// MBR partition table; filesystem starts at this sector
    Partitioned { start_sector: u64 },
    /// Filesystem occupies the whole image
    WholeDisk,
}

impl ImageLayout {
    /// Filesystem offset in sectors
    pub fn sector_offset(&self) -> u64 {
        match self {
            ImageLayout::Partitioned { start_sector } => *start_sector,
            ImageLayout::WholeDisk => 0,
        }
    }

    /// Filesystem offset in bytes
    pub fn byte_offset(&self) -> u64 {
        self.sector_offset() * SECTOR_SIZE
    }

    /// Classify the first sector of an image
    pub fn from_first_sector(sector: &[u8]) -> Result<Self> {
        if sector.len() < SECTOR_SIZE as usize {
            return Err(AppError::Storage("Image shorter than one sector".to_string()));
        }
        if sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != [0x55, 0xAA] {
            return Err(AppError::Storage(
                "Image has no boot signature (not formatted)".to_string(),
            ));
        }

        // A FAT32 boot sector also carries 0x55AA; tell them apart by the fs type field
        if &sector[FAT32_FS_TYPE_OFFSET..FAT32_FS_TYPE_OFFSET + 8] == FAT32_FS_TYPE {
            return Ok(ImageLayout::WholeDisk);
        }

        let entry = &sector[MBR_PARTITION_TABLE_OFFSET..MBR_PARTITION_TABLE_OFFSET + 16];
        let partition_type = entry[4];
        let start_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
        if partition_type == 0 || start_lba == 0 {
            return Err(AppError::Storage(
                "MBR has no usable first partition".to_string(),
            ));
        }

        Ok(ImageLayout::Partitioned {
            start_sector: start_lba as u64,
        })
    }

    /// Probe an image file
    pub fn probe(image: &Path) -> Result<Self> {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        File::open(image)
            .and_then(|mut f| f.read_exact(&mut sector))
            .map_err(|e| {
                AppError::Storage(format!("Failed to read {}: {}", image.display(), e))
            })?;
        Self::from_first_sector(&sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr_sector(partition_type: u8, start_lba: u32) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[446 + 4] = partition_type;
        sector[446 + 8..446 + 12].copy_from_slice(&start_lba.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn test_partitioned_image() {
        let layout = ImageLayout::from_first_sector(&mbr_sector(0x0C, 2048)).unwrap();
        assert_eq!(layout, ImageLayout::Partitioned { start_sector: 2048 });
        assert_eq!(layout.byte_offset(), 1024 * 1024);
    }

    #[test]
    fn test_whole_disk_fat32() {
        let mut sector = vec![0u8; 512];
        sector[0] = 0xEB;
        sector[82..90].copy_from_slice(b"FAT32   ");
        sector[510] = 0x55;
        sector[511] = 0xAA;
        assert_eq!(
            ImageLayout::from_first_sector(&sector).unwrap(),
            ImageLayout::WholeDisk
        );
        assert_eq!(ImageLayout::WholeDisk.sector_offset(), 0);
    }

    #[test]
    fn test_unformatted_or_empty_table() {
        assert!(ImageLayout::from_first_sector(&[0u8; 512]).is_err());
        assert!(ImageLayout::from_first_sector(&mbr_sector(0, 0)).is_err());
        assert!(ImageLayout::from_first_sector(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_probe_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        let mut data = mbr_sector(0x0C, 63);
        data.extend(vec![0u8; 512]);
        std::fs::write(&path, data).unwrap();
        assert_eq!(
            ImageLayout::probe(&path).unwrap(),
            ImageLayout::Partitioned { start_sector: 63 }
        );
        assert!(ImageLayout::probe(&dir.path().join("missing.img")).is_err());
    }
}
