//! Master boot record partition scanner.
//!
//! Reads LBA 0 of every registered physical block device and registers a
//! logical block device for each used primary partition slot. Extended
//! partitions are not supported.

use core::mem::size_of;

use log::{info, warn};

use crate::constants::devices::{MBR_PARTITIONS, MBR_SECTOR_SIZE};
use crate::devices::block::{BlockRequest, DeviceRegistry, LogicalDeviceFlags};
use crate::errors::KernelError;

const MBR_MAGIC: u16 = 0xAA55;

/// One of the four primary partition table entries (16 bytes). The CHS
/// fields are dead weight on LBA-addressed disks and stay opaque.
#[repr(C, packed)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct PartitionTableEntry {
    bootable: u8,
    start_chs: [u8; 3],
    partition_type: u8,
    end_chs: [u8; 3],
    start_lba: u32,
    length: u32,
}

#[repr(C, packed)]
#[allow(dead_code)]
struct MasterBootRecord {
    bootstrap: [u8; 440],
    disk_signature: u32,
    unused: u16,
    primary_partitions: [PartitionTableEntry; MBR_PARTITIONS],
    magic_number: u16,
}

/// Scans every physical block device and registers its partitions.
pub fn scan_logical_block_devices(registry: &mut DeviceRegistry) -> Result<(), KernelError> {
    for id in 0..registry.num_block_devices() as u32 {
        let mut sector = [0u8; MBR_SECTOR_SIZE];
        {
            let device = registry
                .device_mut(id)
                .ok_or(KernelError::InvalidArgument)?;
            if device.block_size != MBR_SECTOR_SIZE {
                warn!(
                    "{}: block size {} is not MBR-addressable, skipping",
                    device.name, device.block_size
                );
                continue;
            }

            device.submit_read_request(BlockRequest {
                lba: 0,
                num_blocks: 1,
                buffer: &mut sector,
            })?;
        }

        debug_assert_eq!(size_of::<MasterBootRecord>(), MBR_SECTOR_SIZE);
        let mbr: MasterBootRecord =
            unsafe { core::ptr::read_unaligned(sector.as_ptr() as *const MasterBootRecord) };

        if mbr.magic_number != MBR_MAGIC {
            warn!("block device {} carries no MBR signature", id);
            continue;
        }

        for (slot, entry) in mbr.primary_partitions.iter().enumerate() {
            // Type 0x00 marks an unused slot.
            if entry.partition_type == 0x00 {
                continue;
            }

            let flags = if entry.bootable != 0x00 {
                LogicalDeviceFlags::BOOTABLE
            } else {
                LogicalDeviceFlags::empty()
            };

            registry.register_logical_block_device(
                id,
                flags,
                entry.start_lba,
                entry.length,
                entry.partition_type,
                slot as u8,
            )?;
        }
    }

    info!(
        "mbr scan found {} logical block device(s)",
        registry.num_logical_block_devices()
    );

    Ok(())
}
