use crate::{check_page_size, check_range, Counters, Pager, PagerError, PagerStats, Result};
use memmap::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A pager that uses a mapped file under the hood to provide the storage space.
#[derive(Debug)]
pub struct MmapPager {
    path: PathBuf,
    page_size: u64,
    file: File,
    /// `None` while the file is empty, zero length maps are rejected by the OS.
    map: RwLock<Option<MmapMut>>,
    counters: Counters,
}

impl MmapPager {
    /// Open the file at the given path, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>, page_size: u64) -> Result<Self> {
        check_page_size(page_size)?;

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % page_size != 0 {
            return Err(PagerError::Misaligned { len, page_size });
        }

        let map = if len == 0 { None } else { Some(map_file(&file)?) };
        debug!(path = %path.display(), len, page_size, "opened pager file");

        Ok(Self {
            path,
            page_size,
            file,
            map: RwLock::new(map),
            counters: Counters::default(),
        })
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map_file(file: &File) -> Result<MmapMut> {
    // SAFETY: the file is owned by the pager and is only resized while the map lock is held
    // exclusively, so no reference into the old mapping outlives a remap.
    let map = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(map)
}

impl Pager for MmapPager {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn pages(&self) -> u64 {
        self.map.read().as_ref().map_or(0, |map| map.len() as u64) / self.page_size
    }

    fn grow(&self, new_pages: u64) -> Result<u64> {
        let mut map = self.map.write();
        let old_len = map.as_ref().map_or(0, |map| map.len() as u64);
        let new_len = new_pages
            .checked_mul(self.page_size)
            .and_then(|len| len.checked_add(old_len))
            .ok_or(PagerError::Overflow(new_pages))?;

        // The current map stays in place until the new one exists.
        self.file.set_len(new_len)?;
        if new_len > 0 {
            let remapped = match map_file(&self.file) {
                Ok(remapped) => remapped,
                Err(err) => {
                    if let Err(undo) = self.file.set_len(old_len) {
                        warn!(
                            path = %self.path.display(),
                            %undo,
                            "failed to shrink pager file back"
                        );
                    }
                    return Err(err);
                }
            };
            if let Some(old) = map.replace(remapped) {
                old.flush()?;
            }
        }

        debug!(path = %self.path.display(), old_len, new_len, "grew pager file");
        Ok(old_len / self.page_size)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.counters.read();
        let map = self.map.read();
        let data: &[u8] = map.as_deref().unwrap_or(&[]);
        let range = check_range(offset, buf.len(), data.len() as u64)?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.counters.write();
        let mut map = self.map.write();
        match map.as_deref_mut() {
            Some(data) => {
                let range = check_range(offset, buf.len(), data.len() as u64)?;
                data[range].copy_from_slice(buf);
                Ok(())
            }
            None => Err(PagerError::OutOfBounds {
                offset,
                len: buf.len(),
                size: 0,
            }),
        }
    }

    fn sync(&self) -> Result<()> {
        if let Some(map) = self.map.read().as_ref() {
            map.flush()?;
        }
        Ok(())
    }

    fn stats(&self) -> PagerStats {
        self.counters.snapshot()
    }
}

impl Drop for MmapPager {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            warn!(path = %self.path.display(), %err, "failed to sync pager on drop");
        }
    }
}
