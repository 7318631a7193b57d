//! VFS dispatch shim.
//!
//! Thin indirection between generic node operations and the mounted FAT32
//! driver. Nodes are plain values: `open`/`finddir` build them, `close`
//! consumes them, and the mount root is owned by the [`Vfs`] itself and
//! never freed.

use alloc::string::{String, ToString};

use log::info;

use crate::devices::block::DeviceRegistry;
use crate::errors::KernelError;
use crate::filesys::fat32::{DirEntry83, Fat32, FatAttributes};
use crate::filesys::{DirEntryInfo, NodeKind};

/// An open file or directory.
#[derive(Debug, Clone)]
pub struct FsNode {
    pub path: String,
    pub size: u32,
    /// Unix-style permission mask derived from the FAT attribute bits.
    pub mask: u32,
    pub kind: NodeKind,
    /// Packed FAT timestamps, `date << 16 | time`.
    pub created: u32,
    pub modified: u32,
    pub accessed: u32,
    /// First cluster of the node's chain.
    pub first_cluster: u32,
}

pub struct Vfs {
    fs: Fat32,
    logical_id: u32,
    root: FsNode,
}

impl Vfs {
    /// Mounts FAT32 on the first logical block device found at boot.
    pub fn mount_first(registry: &mut DeviceRegistry) -> Result<Vfs, KernelError> {
        if registry.num_logical_block_devices() == 0 {
            return Err(KernelError::FilesystemNotSupported);
        }

        Self::mount(registry, 0)
    }

    pub fn mount(registry: &mut DeviceRegistry, logical_id: u32) -> Result<Vfs, KernelError> {
        let fs = {
            let mut part = registry.partition_io(logical_id)?;
            Fat32::mount(&mut part)?
        };

        let root = FsNode {
            path: String::from("/"),
            size: 0,
            mask: 0o755,
            kind: NodeKind::Directory,
            created: 0,
            modified: 0,
            accessed: 0,
            first_cluster: fs.root_cluster(),
        };

        info!(
            "mounted {} as root filesystem",
            registry.logical_devices()[logical_id as usize].name
        );

        Ok(Vfs {
            fs,
            logical_id,
            root,
        })
    }

    /// The mount root. Never freed; `open("/")` hands out clones of it.
    pub fn root(&self) -> &FsNode {
        &self.root
    }

    /// Resolves an absolute path to a node. `/` succeeds without touching
    /// storage; a dead end is `BadPath`, the ordinary failure the shell
    /// reports and survives.
    pub fn open(&self, registry: &mut DeviceRegistry, path: &str) -> Result<FsNode, KernelError> {
        if path.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if path.split('/').all(|component| component.is_empty()) {
            return Ok(self.root.clone());
        }

        let mut part = registry.partition_io(self.logical_id)?;
        match self.fs.resolve_path(&mut part, path)? {
            Some((_, entry)) => Ok(self.node_from_entry(path.to_string(), &entry)),
            None => Err(KernelError::BadPath),
        }
    }

    /// Releases a node. The root is owned by the mount and keeps living.
    pub fn close(&self, node: FsNode) {
        drop(node);
    }

    /// Reads `size` bytes at `offset` of a file node into `buffer`.
    pub fn read(
        &self,
        registry: &mut DeviceRegistry,
        node: &FsNode,
        offset: u32,
        size: u32,
        buffer: &mut [u8],
    ) -> Result<usize, KernelError> {
        if node.kind != NodeKind::File {
            return Err(KernelError::InvalidArgument);
        }

        let mut part = registry.partition_io(self.logical_id)?;
        self.fs
            .read_file(&mut part, node.first_cluster, node.size, offset, size, buffer)
    }

    /// Write support is a stub in the FAT32 driver; this reports the same
    /// success-without-effect.
    pub fn write(
        &self,
        registry: &mut DeviceRegistry,
        node: &FsNode,
        offset: u32,
        buffer: &[u8],
    ) -> Result<usize, KernelError> {
        if node.kind != NodeKind::File {
            return Err(KernelError::InvalidArgument);
        }

        let mut part = registry.partition_io(self.logical_id)?;
        self.fs
            .write_file(&mut part, node.first_cluster, offset, buffer)
    }

    /// The `index`-th live entry of a directory, `Ok(None)` past the end.
    pub fn readdir(
        &self,
        registry: &mut DeviceRegistry,
        node: &FsNode,
        index: u32,
    ) -> Result<Option<DirEntryInfo>, KernelError> {
        if node.kind != NodeKind::Directory {
            return Err(KernelError::InvalidArgument);
        }

        let mut part = registry.partition_io(self.logical_id)?;
        let located = self
            .fs
            .find_entry_by_index(&mut part, node.first_cluster, index)?;

        Ok(located.map(|(name, entry)| DirEntryInfo {
            name,
            inode: entry.first_cluster(),
        }))
    }

    /// Looks one name up inside a directory node.
    pub fn finddir(
        &self,
        registry: &mut DeviceRegistry,
        node: &FsNode,
        name: &str,
    ) -> Result<FsNode, KernelError> {
        if node.kind != NodeKind::Directory {
            return Err(KernelError::InvalidArgument);
        }

        let mut part = registry.partition_io(self.logical_id)?;
        match self.fs.find_entry_by_name(&mut part, node.first_cluster, name)? {
            Some((entry_name, entry)) => {
                let mut path = node.path.clone();
                if !path.ends_with('/') {
                    path.push('/');
                }
                path.push_str(&entry_name);
                Ok(self.node_from_entry(path, &entry))
            }
            None => Err(KernelError::BadPath),
        }
    }

    fn node_from_entry(&self, path: String, entry: &DirEntry83) -> FsNode {
        let kind = if entry.is_directory() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };

        let attrs = entry.attrs();
        let mut mask: u32 = if kind == NodeKind::Directory {
            0o755
        } else {
            0o644
        };
        if attrs.contains(FatAttributes::READ_ONLY) {
            mask &= !0o222;
        }
        if attrs.intersects(FatAttributes::HIDDEN | FatAttributes::SYSTEM) {
            mask &= !0o007;
        }

        let first = entry.first_cluster();
        FsNode {
            path,
            size: entry.size,
            mask,
            kind,
            created: entry.created(),
            modified: entry.modified(),
            accessed: entry.accessed(),
            first_cluster: if first == 0 {
                self.fs.root_cluster()
            } else {
                first
            },
        }
    }
}
