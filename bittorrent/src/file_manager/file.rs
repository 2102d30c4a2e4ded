use std::{fs, io::{Seek, Write}, path};

use crate::store::FileInfo;

use super::Result;

// How eagerly a file's missing pieces should be requested from peers. `Skip`
// files are never created on disk; writes into their byte range are dropped
// and reads return zeroed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePriority {
    Skip,
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug)]
pub struct ManagedFile {
    pub info: FileInfo,
    pub handle: Option<fs::File>,
    pub priority: FilePriority,
}

impl ManagedFile {

    pub fn new(dir: &path::Path, info: FileInfo, priority: FilePriority) -> Result<Self> {

        let handle = if priority == FilePriority::Skip {
            tracing::info!("skipping file creation (priority=Skip): {:?}", &info.path);
            None
        } else {
            Some(Self::create_on_disk(dir, &info)?)
        };

        Ok(Self { info, handle, priority })
    }

    fn create_on_disk(dir: &path::Path, info: &FileInfo) -> Result<fs::File> {
        let path = dir.join(&info.path);
        tracing::info!("creating file: {:?}", &path);
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        handle.set_len(info.length as u64)?;
        Ok(handle)
    }

    // Lazily creates the backing file when a file's priority is raised out of
    // `Skip` after construction.
    pub fn ensure_on_disk(&mut self, dir: &path::Path) -> Result<()> {
        if self.handle.is_none() {
            self.handle = Some(Self::create_on_disk(dir, &self.info)?);
        }
        Ok(())
    }

    pub fn write_blocks(&mut self, offset: usize, blocks: &[std::io::IoSlice<'_>]) -> Result<usize> {
        let written: usize = blocks.iter().map(|b| b.len()).sum();
        let Some(handle) = self.handle.as_mut() else {
            // Skip file: drop the bytes, report success so the caller's
            // offset bookkeeping doesn't stall on a range we never store.
            return Ok(written);
        };
        handle.seek(std::io::SeekFrom::Start(offset as u64))?;
        Ok(handle.write_vectored(blocks)?)
    }

    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        let Some(handle) = self.handle.as_mut() else {
            buf.fill(0);
            return Ok(buf.len());
        };
        handle.seek(std::io::SeekFrom::Start(offset as u64))?;
        Ok(handle.read(buf)?)
    }

    pub fn on_disk_len(&self) -> Result<u64> {
        match &self.handle {
            Some(handle) => Ok(handle.metadata()?.len()),
            None => Ok(0),
        }
    }
}
