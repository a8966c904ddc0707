//! Numbered append-mostly record files.
//!
//! Every record is a 4-byte little-endian length followed by the payload.
//! Offsets point at the length prefix.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const RECORD_PREFIX_LEN: u64 = 4;

/// Locator of one record: file number plus byte offset of its length prefix.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DiskBlockPos {
    pub file_id: u32,
    pub offset: u64,
}

impl DiskBlockPos {
    pub const ENCODED_LEN: usize = 12;

    pub fn new(file_id: u32, offset: u64) -> Self {
        Self { file_id, offset }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        Some(Self { file_id, offset })
    }
}

impl std::fmt::Display for DiskBlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file {} offset {}", self.file_id, self.offset)
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

/// Reserved length of every file, indexed by file id. The last entry is the
/// file new records roll into.
#[derive(Debug)]
struct FlatFileState {
    lens: Vec<u64>,
}

impl FlatFileState {
    fn current_file(&self) -> u32 {
        self.lens.len().saturating_sub(1) as u32
    }

    fn ensure_file(&mut self, file_id: u32) {
        let wanted = file_id as usize + 1;
        if self.lens.len() < wanted {
            self.lens.resize(wanted, 0);
        }
    }
}

impl FlatFileStore {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, FlatFileError> {
        Self::new_with_prefix(dir, "blk", max_file_size)
    }

    pub fn new_with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let lens = Self::scan_files(&dir, &prefix)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            state: Mutex::new(FlatFileState { lens }),
        })
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn current_file(&self) -> u32 {
        self.lock_state().current_file()
    }

    /// Reserve room for a payload of `payload_len` bytes in the active file,
    /// rolling to a fresh file when the record would not fit.
    pub fn allocate(&self, payload_len: u64) -> DiskBlockPos {
        let mut state = self.lock_state();
        Self::allocate_locked(&mut state, payload_len, self.max_file_size)
    }

    /// Reserve room in a specific file regardless of its size.
    pub fn allocate_in(&self, file_id: u32, payload_len: u64) -> DiskBlockPos {
        let mut state = self.lock_state();
        state.ensure_file(file_id);
        let slot = &mut state.lens[file_id as usize];
        let offset = *slot;
        *slot += RECORD_PREFIX_LEN + payload_len;
        DiskBlockPos::new(file_id, offset)
    }

    /// Record that a record already lives at `pos` so later allocations do
    /// not overlap it.
    pub fn note_existing(&self, pos: DiskBlockPos, payload_len: u64) {
        let mut state = self.lock_state();
        state.ensure_file(pos.file_id);
        let end = pos.offset + RECORD_PREFIX_LEN + payload_len;
        let slot = &mut state.lens[pos.file_id as usize];
        if *slot < end {
            *slot = end;
        }
    }

    pub fn write_at(&self, pos: DiskBlockPos, bytes: &[u8]) -> Result<(), FlatFileError> {
        let len = u32::try_from(bytes.len()).map_err(|_| FlatFileError::LengthMismatch)?;
        let _state = self.lock_state();
        let path = self.file_path(pos.file_id);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(pos.offset))?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    pub fn append(&self, bytes: &[u8]) -> Result<DiskBlockPos, FlatFileError> {
        let pos = self.allocate(bytes.len() as u64);
        self.write_at(pos, bytes)?;
        Ok(pos)
    }

    pub fn read(&self, pos: DiskBlockPos) -> Result<Vec<u8>, FlatFileError> {
        let path = self.file_path(pos.file_id);
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if pos.offset + RECORD_PREFIX_LEN > file_len {
            return Err(FlatFileError::InvalidLocation);
        }
        file.seek(SeekFrom::Start(pos.offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let stored_len = u32::from_le_bytes(len_bytes) as u64;
        if pos.offset + RECORD_PREFIX_LEN + stored_len > file_len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }

    fn allocate_locked(
        state: &mut FlatFileState,
        payload_len: u64,
        max_file_size: u64,
    ) -> DiskBlockPos {
        let needed = RECORD_PREFIX_LEN + payload_len;
        if state.lens.is_empty() {
            state.lens.push(0);
        }
        let current = state.current_file();
        let current_len = state.lens[current as usize];
        if current_len > 0 && current_len + needed > max_file_size {
            state.lens.push(0);
        }
        let file_id = state.current_file();
        let slot = &mut state.lens[file_id as usize];
        let offset = *slot;
        *slot += needed;
        DiskBlockPos::new(file_id, offset)
    }

    fn lock_state(&self) -> MutexGuard<'_, FlatFileState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scan_files(dir: &Path, prefix: &str) -> Result<Vec<u64>, FlatFileError> {
        let mut lens = Vec::new();
        loop {
            let path = dir.join(format!("{prefix}{:05}.dat", lens.len()));
            if !path.exists() {
                break;
            }
            lens.push(std::fs::metadata(&path)?.len());
        }
        Ok(lens)
    }
}
