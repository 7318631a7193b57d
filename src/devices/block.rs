//! Block device layer.
//!
//! Physical devices register a [`BlockDriver`] implementation and get a
//! sequential id plus an `sd?` name. Logical devices are partition windows
//! produced by the MBR scan, registered once and never mutated. All I/O is
//! synchronous: a request is serviced block by block inside the call, with no
//! queue, retry or partial-result reporting.

use alloc::boxed::Box;

use arrayvec::{ArrayString, ArrayVec};
use bitflags::bitflags;
use log::info;

use crate::constants::devices::{DEVICE_NAME_LEN, MAX_BLOCK_DEVICES, MAX_LOGICAL_BLOCK_DEVICES};
use crate::errors::KernelError;

/// What a disk driver supplies: single-block transfers at a fixed block
/// size declared at registration.
pub trait BlockDriver {
    fn read_block(&mut self, lba: u32, buffer: &mut [u8]) -> Result<(), KernelError>;
    fn write_block(&mut self, lba: u32, buffer: &[u8]) -> Result<(), KernelError>;
}

pub struct BlockDevice {
    pub id: u32,
    pub name: ArrayString<DEVICE_NAME_LEN>,
    pub block_size: usize,
    pub total_blocks: u32,
    driver: Box<dyn BlockDriver>,
}

/// A transient transfer description: `num_blocks` blocks starting at `lba`,
/// through the caller-owned buffer.
pub struct BlockRequest<'a> {
    pub lba: u32,
    pub num_blocks: u32,
    pub buffer: &'a mut [u8],
}

impl BlockDevice {
    /// Reads block by block into consecutive `block_size` windows of the
    /// request buffer. The first failing block aborts the request.
    pub fn submit_read_request(&mut self, request: BlockRequest<'_>) -> Result<(), KernelError> {
        let block_size = self.block_size;
        if request.buffer.len() < request.num_blocks as usize * block_size {
            return Err(KernelError::InvalidArgument);
        }

        for i in 0..request.num_blocks as usize {
            let window = &mut request.buffer[i * block_size..(i + 1) * block_size];
            self.driver.read_block(request.lba + i as u32, window)?;
        }

        Ok(())
    }

    /// Writes block by block from consecutive windows of the request buffer.
    pub fn submit_write_request(&mut self, request: BlockRequest<'_>) -> Result<(), KernelError> {
        let block_size = self.block_size;
        if request.buffer.len() < request.num_blocks as usize * block_size {
            return Err(KernelError::InvalidArgument);
        }

        for i in 0..request.num_blocks as usize {
            let window = &request.buffer[i * block_size..(i + 1) * block_size];
            self.driver.write_block(request.lba + i as u32, window)?;
        }

        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LogicalDeviceFlags: u8 {
        const BOOTABLE = 1 << 0;
    }
}

/// A partition: an LBA-offset window into a physical block device.
/// Registration-time metadata only; never mutated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct LogicalBlockDevice {
    pub id: u32,
    pub name: ArrayString<DEVICE_NAME_LEN>,
    /// Id of the parent physical device.
    pub parent: u32,
    pub flags: LogicalDeviceFlags,
    pub lba_offset: u32,
    pub num_blocks: u32,
    pub partition_type: u8,
    /// Partition-table slot on the parent.
    pub local_id: u8,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: ArrayVec<BlockDevice, MAX_BLOCK_DEVICES>,
    logical: ArrayVec<LogicalBlockDevice, MAX_LOGICAL_BLOCK_DEVICES>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a physical device; ids are sequential, names run `sda`,
    /// `sdb`, ...
    pub fn register_block_device(
        &mut self,
        block_size: usize,
        total_blocks: u32,
        driver: Box<dyn BlockDriver>,
    ) -> Result<u32, KernelError> {
        if self.devices.is_full() {
            return Err(KernelError::OutOfMemory);
        }

        let id = self.devices.len() as u32;
        let mut name = ArrayString::new();
        name.push_str("sd");
        name.push((b'a' + id as u8) as char);

        info!(
            "registered block device {} ({} blocks of {} bytes)",
            name, total_blocks, block_size
        );

        self.devices.push(BlockDevice {
            id,
            name,
            block_size,
            total_blocks,
            driver,
        });

        Ok(id)
    }

    /// Registers a partition of an already-registered parent. The name is
    /// the parent's plus the one-based slot, e.g. `sda1`.
    pub fn register_logical_block_device(
        &mut self,
        parent: u32,
        flags: LogicalDeviceFlags,
        lba_offset: u32,
        num_blocks: u32,
        partition_type: u8,
        local_id: u8,
    ) -> Result<u32, KernelError> {
        if self.logical.is_full() {
            return Err(KernelError::OutOfMemory);
        }

        let parent_device = self
            .devices
            .get(parent as usize)
            .ok_or(KernelError::InvalidArgument)?;

        let id = self.logical.len() as u32;
        let mut name = parent_device.name;
        name.push((b'1' + local_id) as char);

        info!(
            "registered logical block device {} (type {:#04x}, {} blocks at lba {})",
            name, partition_type, num_blocks, lba_offset
        );

        self.logical.push(LogicalBlockDevice {
            id,
            name,
            parent,
            flags,
            lba_offset,
            num_blocks,
            partition_type,
            local_id,
        });

        Ok(id)
    }

    pub fn devices(&self) -> &[BlockDevice] {
        &self.devices
    }

    pub fn device_mut(&mut self, id: u32) -> Option<&mut BlockDevice> {
        self.devices.get_mut(id as usize)
    }

    pub fn num_block_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn logical_devices(&self) -> &[LogicalBlockDevice] {
        &self.logical
    }

    pub fn num_logical_block_devices(&self) -> usize {
        self.logical.len()
    }

    /// Partition-relative I/O view over a logical device.
    pub fn partition_io(&mut self, logical_id: u32) -> Result<PartitionIo<'_>, KernelError> {
        let logical = *self
            .logical
            .get(logical_id as usize)
            .ok_or(KernelError::InvalidArgument)?;
        let device = self
            .devices
            .get_mut(logical.parent as usize)
            .ok_or(KernelError::InvalidArgument)?;

        Ok(PartitionIo {
            device,
            lba_offset: logical.lba_offset,
            num_blocks: logical.num_blocks,
        })
    }
}

/// Offsets LBAs by the partition start and bounds-checks against its length.
pub struct PartitionIo<'a> {
    device: &'a mut BlockDevice,
    lba_offset: u32,
    num_blocks: u32,
}

impl PartitionIo<'_> {
    pub fn block_size(&self) -> usize {
        self.device.block_size
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn read(
        &mut self,
        lba: u32,
        num_blocks: u32,
        buffer: &mut [u8],
    ) -> Result<(), KernelError> {
        if lba + num_blocks > self.num_blocks {
            return Err(KernelError::InvalidArgument);
        }

        self.device.submit_read_request(BlockRequest {
            lba: self.lba_offset + lba,
            num_blocks,
            buffer,
        })
    }

    pub fn write(
        &mut self,
        lba: u32,
        num_blocks: u32,
        buffer: &mut [u8],
    ) -> Result<(), KernelError> {
        if lba + num_blocks > self.num_blocks {
            return Err(KernelError::InvalidArgument);
        }

        self.device.submit_write_request(BlockRequest {
            lba: self.lba_offset + lba,
            num_blocks,
            buffer,
        })
    }
}
