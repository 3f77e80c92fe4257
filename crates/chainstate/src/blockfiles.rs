//! Seam to the external block-file writer.
//!
//! The append-only `blk*`/`rev*` files live outside this crate; the core
//! only hands bytes over and keeps the returned positions in the block
//! index.

use std::sync::Mutex;

use izzy_storage::StoreError;

/// Location of a record inside the flat files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DiskPos {
    pub file: i32,
    pub pos: u32,
}

impl DiskPos {
    pub fn new(file: i32, pos: u32) -> Self {
        Self { file, pos }
    }
}

pub trait BlockFiles: Send + Sync {
    fn append_block(&self, bytes: &[u8]) -> Result<DiskPos, StoreError>;
    fn append_undo(&self, bytes: &[u8]) -> Result<DiskPos, StoreError>;
    fn read_block(&self, pos: DiskPos) -> Result<Vec<u8>, StoreError>;
    fn read_undo(&self, pos: DiskPos) -> Result<Vec<u8>, StoreError>;
}

impl<T: BlockFiles + ?Sized> BlockFiles for std::sync::Arc<T> {
    fn append_block(&self, bytes: &[u8]) -> Result<DiskPos, StoreError> {
        self.as_ref().append_block(bytes)
    }

    fn append_undo(&self, bytes: &[u8]) -> Result<DiskPos, StoreError> {
        self.as_ref().append_undo(bytes)
    }

    fn read_block(&self, pos: DiskPos) -> Result<Vec<u8>, StoreError> {
        self.as_ref().read_block(pos)
    }

    fn read_undo(&self, pos: DiskPos) -> Result<Vec<u8>, StoreError> {
        self.as_ref().read_undo(pos)
    }
}

/// In-memory stand-in used by tests and the unittest network.
#[derive(Default)]
pub struct MemoryBlockFiles {
    blocks: Mutex<Vec<Vec<u8>>>,
    undos: Mutex<Vec<Vec<u8>>>,
}

impl MemoryBlockFiles {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockFiles for MemoryBlockFiles {
    fn append_block(&self, bytes: &[u8]) -> Result<DiskPos, StoreError> {
        let mut blocks = self.blocks.lock().expect("block files lock");
        blocks.push(bytes.to_vec());
        Ok(DiskPos::new(0, blocks.len() as u32 - 1))
    }

    fn append_undo(&self, bytes: &[u8]) -> Result<DiskPos, StoreError> {
        let mut undos = self.undos.lock().expect("block files lock");
        undos.push(bytes.to_vec());
        Ok(DiskPos::new(0, undos.len() as u32 - 1))
    }

    fn read_block(&self, pos: DiskPos) -> Result<Vec<u8>, StoreError> {
        let blocks = self.blocks.lock().expect("block files lock");
        blocks
            .get(pos.pos as usize)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("missing block at {}:{}", pos.file, pos.pos)))
    }

    fn read_undo(&self, pos: DiskPos) -> Result<Vec<u8>, StoreError> {
        let undos = self.undos.lock().expect("block files lock");
        undos
            .get(pos.pos as usize)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("missing undo at {}:{}", pos.file, pos.pos)))
    }
}
