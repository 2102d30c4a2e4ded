// Owns the on-disk files backing a torrent and the byte-addressed read/write
// path peers and the piece store go through. Piece-level hash verification
// lives in `piece_store` - this layer only knows file boundaries and bytes.

use std::{collections::HashMap, io::IoSlice, path::PathBuf, sync::RwLock};

use crate::store::StoreInfo;

mod file;

pub use file::{FilePriority, ManagedFile};

#[derive(thiserror::Error, Debug)]
pub enum FileManagerError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("lock poisoned: {0}")]
    Poisoned(String),

    #[error("file index {0} out of range")]
    InvalidFileIndex(usize),

    #[error("offset {offset} + len {len} exceeds torrent length {total}")]
    OutOfRange { offset: usize, len: usize, total: u64 },
}

impl<T> From<std::sync::PoisonError<T>> for FileManagerError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        FileManagerError::Poisoned(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FileManagerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateMode {
    // File sizes match what the metainfo expects.
    Quick,
    // Every piece re-hashed; callers drive this through the piece store since
    // only it holds the piece hash list.
    Full,
}

#[derive(Debug)]
pub struct FileManager {
    info: StoreInfo,
    files: Vec<RwLock<ManagedFile>>,
}

impl FileManager {

    pub fn new(info: StoreInfo, priorities: &HashMap<usize, FilePriority>) -> Result<Self> {

        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        let mut files = Vec::with_capacity(info.files.len());
        for (idx, file) in info.files.iter().enumerate() {
            let priority = priorities.get(&idx).copied().unwrap_or_default();

            // Skipped files are never created, so there's no point creating
            // their parent directory either unless a sibling file needs it.
            if priority != FilePriority::Skip {
                let path = info.output_dir.join(&file.path);
                if let Some(subdir) = path.parent() {
                    if !subdir.exists() {
                        std::fs::create_dir_all(subdir)?;
                    }
                }
            }
            files.push(RwLock::new(ManagedFile::new(&info.output_dir, file.clone(), priority)?));
        }

        Ok(Self { info, files })
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.info.output_dir
    }

    // Writes a contiguous byte range, splitting across file boundaries as needed.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {

        let end = offset + data.len();
        if end as u64 > self.info.total_len {
            return Err(FileManagerError::OutOfRange { offset, len: data.len(), total: self.info.total_len });
        }

        let mut written = 0;
        for file_lock in &self.files {
            let mut file = file_lock.write()?;
            let range = file.info.byte_range();
            if range.end <= offset + written || range.start >= end {
                continue;
            }

            let chunk_start = offset + written;
            let chunk_end = (range.end).min(end);
            if chunk_start >= chunk_end {
                continue;
            }

            let slice = &data[written..written + (chunk_end - chunk_start)];
            let file_offset = chunk_start - range.start;
            let n = file.write_blocks(file_offset, &[IoSlice::new(slice)])?;
            debug_assert_eq!(n, slice.len());
            written += slice.len();

            if offset + written >= end {
                break;
            }
        }

        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {

        let end = offset + len;
        if end as u64 > self.info.total_len {
            return Err(FileManagerError::OutOfRange { offset, len, total: self.info.total_len });
        }

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        for file_lock in &self.files {
            let mut file = file_lock.write()?;
            let range = file.info.byte_range();
            if range.end <= offset + filled || range.start >= end {
                continue;
            }

            let chunk_start = offset + filled;
            let chunk_end = range.end.min(end);
            if chunk_start >= chunk_end {
                continue;
            }

            let chunk_len = chunk_end - chunk_start;
            let file_offset = chunk_start - range.start;
            let n = file.read_at(file_offset, &mut buf[filled..filled + chunk_len])?;
            debug_assert_eq!(n, chunk_len);
            filled += chunk_len;

            if offset + filled >= end {
                break;
            }
        }

        Ok(buf)
    }

    pub fn set_priority(&self, file_idx: usize, priority: FilePriority) -> Result<()> {
        let file_lock = self.files.get(file_idx).ok_or(FileManagerError::InvalidFileIndex(file_idx))?;
        let mut file = file_lock.write()?;
        if priority != FilePriority::Skip {
            file.ensure_on_disk(&self.info.output_dir)?;
        }
        file.priority = priority;
        Ok(())
    }

    pub fn priority(&self, file_idx: usize) -> Result<FilePriority> {
        let file = self.files.get(file_idx).ok_or(FileManagerError::InvalidFileIndex(file_idx))?;
        Ok(file.read()?.priority)
    }

    // File sizes on disk match the torrent's metainfo-declared lengths.
    // Skipped files are never created, so they're excluded from the check.
    pub fn validate_quick(&self) -> Result<bool> {
        for file_lock in &self.files {
            let file = file_lock.read()?;
            if file.priority == FilePriority::Skip {
                continue;
            }
            if file.on_disk_len()? != file.info.length as u64 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileInfo;

    fn store_info(dir: &std::path::Path) -> StoreInfo {
        StoreInfo {
            total_len: 30,
            piece_len: 10,
            last_piece_len: 10,
            num_pieces: 3,
            files: vec![
                FileInfo { path: "a.bin".into(), length: 15, offset: 0, md5sum: None, pieces_root: None },
                FileInfo { path: "b.bin".into(), length: 15, offset: 15, md5sum: None, pieces_root: None },
            ],
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn write_spans_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::new(store_info(dir.path()), &HashMap::new()).unwrap();

        let data = vec![7u8; 20];
        fm.write(10, &data).unwrap();

        let back = fm.read(10, 20).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn quick_validate_checks_file_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::new(store_info(dir.path()), &HashMap::new()).unwrap();
        assert!(fm.validate_quick().unwrap());
    }

    #[test]
    fn set_and_get_priority() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::new(store_info(dir.path()), &HashMap::new()).unwrap();
        fm.set_priority(1, FilePriority::Skip).unwrap();
        assert_eq!(fm.priority(1).unwrap(), FilePriority::Skip);
    }

    #[test]
    fn skip_priority_file_is_never_created_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut priorities = HashMap::new();
        priorities.insert(1, FilePriority::Skip);
        let fm = FileManager::new(store_info(dir.path()), &priorities).unwrap();

        assert!(!dir.path().join("b.bin").exists());
        assert!(dir.path().join("a.bin").exists());
    }

    #[test]
    fn writes_into_skip_range_are_dropped_and_reads_return_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut priorities = HashMap::new();
        priorities.insert(1, FilePriority::Skip);
        let fm = FileManager::new(store_info(dir.path()), &priorities).unwrap();

        // Spans a.bin (wanted) and b.bin (skipped).
        let data = vec![9u8; 20];
        fm.write(10, &data).unwrap();
        assert!(!dir.path().join("b.bin").exists());

        let back = fm.read(10, 20).unwrap();
        assert_eq!(&back[..5], &[9u8; 5]);
        assert_eq!(&back[5..], &[0u8; 15]);
    }

    #[test]
    fn raising_priority_off_skip_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut priorities = HashMap::new();
        priorities.insert(1, FilePriority::Skip);
        let fm = FileManager::new(store_info(dir.path()), &priorities).unwrap();
        assert!(!dir.path().join("b.bin").exists());

        fm.set_priority(1, FilePriority::Normal).unwrap();
        assert!(dir.path().join("b.bin").exists());
    }
}
