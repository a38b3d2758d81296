// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use tracing::{info, trace};

use crate::{
    api::*,
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
};

/// Sizes and locations derived from the boot sector. Never changes after
/// the volume is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub sector_size: u64,
    pub cluster_size: u64,
    pub file_record_size: u64,
    pub index_record_size: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub mft_position: u64,
    pub total_sectors: u64,
    pub total_clusters: u64,
    pub volume_size: u64,
    pub serial_number: u64,
    pub media_descriptor: u8,
}

impl VolumeGeometry {
    pub fn from_boot_sector(data: &[u8]) -> NtfsResult<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(NtfsError::InvalidBootSector {
                details: "boot sector is truncated",
            });
        }
        if &data[3..11] != NTFS_SIGNATURE {
            return Err(NtfsError::BadRecordHeader {
                details: "missing NTFS boot sector signature",
            });
        }

        let boot_sector: BootSector = read_struct(&data[..BOOT_SECTOR_SIZE])?;

        let sector_size = boot_sector.sector_size as u64;
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(NtfsError::InvalidBootSector {
                details: "sector size is not a power of two",
            });
        }
        let sectors_per_cluster = boot_sector.sectors_per_cluster as u64;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(NtfsError::InvalidBootSector {
                details: "sectors per cluster is not a power of two",
            });
        }

        let cluster_size = sectors_per_cluster * sector_size;
        let file_record_size = record_size(boot_sector.file_record_size_info, cluster_size)?;
        let index_record_size = record_size(boot_sector.index_record_size_info, cluster_size)?;

        let mft_position =
            boot_sector
                .mft_lcn
                .checked_mul(cluster_size)
                .ok_or(NtfsError::InvalidBootSector {
                    details: "MFT location overflows",
                })?;

        Ok(VolumeGeometry {
            sector_size,
            cluster_size,
            file_record_size,
            index_record_size,
            mft_lcn: boot_sector.mft_lcn,
            mft_mirror_lcn: boot_sector.mft_mirror_lcn,
            mft_position,
            total_sectors: boot_sector.total_sectors,
            total_clusters: boot_sector.total_sectors / sectors_per_cluster,
            volume_size: boot_sector.total_sectors.saturating_mul(sector_size),
            serial_number: boot_sector.serial_number,
            media_descriptor: boot_sector.media_descriptor,
        })
    }
}

// Positive values count clusters, negative values are a power of two in bytes.
fn record_size(info: i8, cluster_size: u64) -> NtfsResult<u64> {
    match info {
        0 => Err(NtfsError::InvalidBootSector {
            details: "record size is zero",
        }),
        n if n > 0 => Ok(n as u64 * cluster_size),
        n => {
            let shift = -(n as i32);
            if shift >= 32 {
                return Err(NtfsError::InvalidBootSector {
                    details: "record size shift out of range",
                });
            }
            Ok(1u64 << shift)
        }
    }
}

/// A block device bound to the geometry found on it.
pub struct Volume<D: BlockDevice> {
    device: D,
    pub geometry: VolumeGeometry,
}

impl<D: BlockDevice> Volume<D> {
    pub fn new(mut device: D) -> NtfsResult<Self> {
        let boot_sector = device.read_bytes(0, BOOT_SECTOR_SIZE)?;
        let geometry = VolumeGeometry::from_boot_sector(&boot_sector)?;

        info!(
            "Opened NTFS volume: cluster {} bytes, record {} bytes, MFT at {:#x}",
            geometry.cluster_size, geometry.file_record_size, geometry.mft_position
        );

        Ok(Volume { device, geometry })
    }

    pub fn read_bytes(&mut self, offset: u64, length: usize) -> NtfsResult<Vec<u8>> {
        Ok(self.device.read_bytes(offset, length)?)
    }

    /// Reads `count` whole clusters starting at `start`. Sparse ranges are
    /// zero filled without touching the device.
    pub fn read_clusters_or_zero(
        &mut self,
        start: u64,
        count: u64,
        sparse: bool,
    ) -> NtfsResult<Vec<u8>> {
        let length = count
            .checked_mul(self.geometry.cluster_size)
            .and_then(|l| usize::try_from(l).ok())
            .ok_or(NtfsError::InvalidDataRun {
                details: "cluster range too large",
            })?;

        if sparse {
            return Ok(vec![0u8; length]);
        }

        let offset = start
            .checked_mul(self.geometry.cluster_size)
            .ok_or(NtfsError::InvalidDataRun {
                details: "cluster offset overflow",
            })?;

        trace!("Reading {} clusters at LCN {:#x}", count, start);
        self.read_bytes(offset, length)
    }

    pub fn device_control(
        &mut self,
        code: u32,
        input: &[u8],
        output_size: usize,
    ) -> NtfsResult<Vec<u8>> {
        Ok(self.device.device_control(code, input, output_size)?)
    }

    pub fn letter(&self) -> Option<char> {
        self.device.volume_letter()
    }

    /// Accepts `"C"` or `"C:"`. A device without a letter accepts any single
    /// drive letter.
    pub fn is_volume_letter(&self, token: &str) -> bool {
        let drive = token.strip_suffix(':').unwrap_or(token);
        let mut chars = drive.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return false;
        };
        if !c.is_ascii_alphabetic() {
            return false;
        }

        match self.letter() {
            Some(letter) => letter.eq_ignore_ascii_case(&c),
            None => true,
        }
    }

    pub fn prefix(&self) -> String {
        match self.letter() {
            Some(letter) => format!("{}:\\", letter),
            None => "\\".to_string(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}
