//! In-memory block device.
//!
//! Stands in for a disk controller wherever one is not available: the boot
//! ram disk and the filesystem tests.

use alloc::vec;
use alloc::vec::Vec;

use crate::devices::block::BlockDriver;
use crate::errors::KernelError;

pub struct RamDisk {
    /// Blocks of data, each block_size bytes.
    blocks: Vec<Vec<u8>>,

    /// Size of each block in bytes.
    block_size: usize,
}

impl RamDisk {
    /// Creates a zero-filled ram disk.
    pub fn new(total_blocks: u32, block_size: usize) -> Self {
        let blocks = (0..total_blocks).map(|_| vec![0; block_size]).collect();
        Self { blocks, block_size }
    }

    /// Creates a ram disk holding `image`, zero-padding the final block.
    pub fn from_image(image: &[u8], block_size: usize) -> Self {
        let blocks = image
            .chunks(block_size)
            .map(|chunk| {
                let mut block = vec![0; block_size];
                block[..chunk.len()].copy_from_slice(chunk);
                block
            })
            .collect();
        Self { blocks, block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn validate(&self, lba: u32, buffer: &[u8]) -> Result<(), KernelError> {
        if lba as usize >= self.blocks.len() {
            return Err(KernelError::Io);
        }
        if buffer.len() != self.block_size {
            return Err(KernelError::Io);
        }
        Ok(())
    }
}

impl BlockDriver for RamDisk {
    fn read_block(&mut self, lba: u32, buffer: &mut [u8]) -> Result<(), KernelError> {
        self.validate(lba, buffer)?;
        buffer.copy_from_slice(&self.blocks[lba as usize]);
        Ok(())
    }

    fn write_block(&mut self, lba: u32, buffer: &[u8]) -> Result<(), KernelError> {
        self.validate(lba, buffer)?;
        self.blocks[lba as usize].copy_from_slice(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_block() {
        let mut disk = RamDisk::new(4, 512);
        let data = [0xA5u8; 512];
        disk.write_block(2, &data).unwrap();

        let mut readback = [0u8; 512];
        disk.read_block(2, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn rejects_out_of_range_and_bad_buffers() {
        let mut disk = RamDisk::new(4, 512);
        let mut buffer = [0u8; 512];
        assert_eq!(disk.read_block(4, &mut buffer), Err(KernelError::Io));

        let mut short = [0u8; 100];
        assert_eq!(disk.read_block(0, &mut short), Err(KernelError::Io));
    }

    #[test]
    fn image_is_padded_to_whole_blocks() {
        let image = [1u8; 700];
        let mut disk = RamDisk::from_image(&image, 512);
        assert_eq!(disk.total_blocks(), 2);

        let mut block = [0u8; 512];
        disk.read_block(1, &mut block).unwrap();
        assert!(block[..188].iter().all(|&b| b == 1));
        assert!(block[188..].iter().all(|&b| b == 0));
    }
}
