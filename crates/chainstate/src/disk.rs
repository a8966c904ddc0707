//! Block and undo storage behind the chain state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::filemeta::FlatFileInfo;
use crate::flatfiles::{FlatFileError, FlatFileStore, RECORD_PREFIX_LEN};

pub use crate::flatfiles::DiskBlockPos;

pub const DEFAULT_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

/// Disk collaborator consumed by block acceptance and the undo engine.
///
/// Callers serialize every call under the chain state lock, so position
/// allocation and the write that fills it never interleave with another
/// writer.
pub trait BlockFiles: Send {
    /// Allocate room for a block of `size` bytes, or account for a block
    /// that already sits at `known`.
    fn find_block_pos(
        &mut self,
        known: Option<DiskBlockPos>,
        size: u64,
        height: i32,
        time: u32,
    ) -> Result<DiskBlockPos, FlatFileError>;

    fn write_block(&mut self, pos: DiskBlockPos, bytes: &[u8]) -> Result<(), FlatFileError>;

    fn read_block(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError>;

    /// Append an undo record next to the blocks of `file_id`.
    fn write_undo(&mut self, file_id: u32, bytes: &[u8]) -> Result<DiskBlockPos, FlatFileError>;

    /// Read-only access to the undo record at `pos`.
    fn open_undo_file(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError>;

    fn file_infos(&self) -> Vec<(u32, FlatFileInfo)>;

    fn restore_file_info(&mut self, _file_id: u32, _info: FlatFileInfo) {}
}

/// `BlockFiles` over two flat-file stores: `blk?????.dat` for block bodies
/// and `rev?????.dat` for undo records sharing the block file numbering.
pub struct FlatFileBlocks {
    blocks: FlatFileStore,
    undo: FlatFileStore,
    infos: BTreeMap<u32, FlatFileInfo>,
}

impl FlatFileBlocks {
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let blocks = FlatFileStore::new_with_prefix(&dir, "blk", max_file_size)?;
        let undo = FlatFileStore::new_with_prefix(&dir, "rev", max_file_size)?;
        Ok(Self::new(blocks, undo))
    }

    pub fn new(blocks: FlatFileStore, undo: FlatFileStore) -> Self {
        Self {
            blocks,
            undo,
            infos: BTreeMap::new(),
        }
    }

    pub fn info(&self, file_id: u32) -> Option<FlatFileInfo> {
        self.infos.get(&file_id).copied()
    }
}

impl BlockFiles for FlatFileBlocks {
    fn find_block_pos(
        &mut self,
        known: Option<DiskBlockPos>,
        size: u64,
        height: i32,
        time: u32,
    ) -> Result<DiskBlockPos, FlatFileError> {
        let pos = match known {
            Some(pos) => {
                self.blocks.note_existing(pos, size);
                pos
            }
            None => {
                if size + RECORD_PREFIX_LEN > self.blocks.max_file_size() {
                    return Err(FlatFileError::LengthMismatch);
                }
                self.blocks.allocate(size)
            }
        };
        let info = self.infos.entry(pos.file_id).or_default();
        info.add_block(height, time);
        info.size = info.size.max(pos.offset + RECORD_PREFIX_LEN + size);
        Ok(pos)
    }

    fn write_block(&mut self, pos: DiskBlockPos, bytes: &[u8]) -> Result<(), FlatFileError> {
        self.blocks.write_at(pos, bytes)
    }

    fn read_block(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError> {
        self.blocks.read(pos)
    }

    fn write_undo(&mut self, file_id: u32, bytes: &[u8]) -> Result<DiskBlockPos, FlatFileError> {
        let pos = self.undo.allocate_in(file_id, bytes.len() as u64);
        self.undo.write_at(pos, bytes)?;
        let info = self.infos.entry(file_id).or_default();
        info.undo_size = info
            .undo_size
            .max(pos.offset + RECORD_PREFIX_LEN + bytes.len() as u64);
        Ok(pos)
    }

    fn open_undo_file(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError> {
        self.undo.read(pos)
    }

    fn file_infos(&self) -> Vec<(u32, FlatFileInfo)> {
        self.infos.iter().map(|(id, info)| (*id, *info)).collect()
    }

    fn restore_file_info(&mut self, file_id: u32, info: FlatFileInfo) {
        self.infos.insert(file_id, info);
    }
}
