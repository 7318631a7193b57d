/// Registry capacity for physical block devices.
pub const MAX_BLOCK_DEVICES: usize = 10;

/// Registry capacity for logical block devices (partitions).
pub const MAX_LOGICAL_BLOCK_DEVICES: usize = 50;

/// Capacity of a device name, including the partition suffix.
pub const DEVICE_NAME_LEN: usize = 16;

/// Primary partition slots in a master boot record.
pub const MBR_PARTITIONS: usize = 4;

/// Byte size of a master boot record sector.
pub const MBR_SECTOR_SIZE: usize = 512;
