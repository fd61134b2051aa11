// Bounded cache of open data-log handles.
//
// Each log is opened once and shared as an `Arc<LogFile>`; its own mutex
// serialises seek-to-end + append so the returned offset is exactly
// where the bytes landed.  The LRU bounds how many handles the cache
// pins.  A handle evicted while a writer still holds it stays reachable
// through the live map, so two handles to one log never coexist.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

/// Default number of open handles kept per store.
pub const DEFAULT_HANDLE_CAPACITY: usize = 2048;

/// One open append-only log.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes`, returning the offset they start at.
    pub fn append(&self, bytes: &[u8]) -> io::Result<u64> {
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        Ok(offset)
    }

    /// Read up to `length` bytes at `offset`; fewer only at end of file.
    pub fn read_at(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(length.min(1 << 24) as usize);
        (&mut *file).take(length).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }
}

struct Inner {
    lru: LruCache<PathBuf, Arc<LogFile>>,
    live: HashMap<PathBuf, Weak<LogFile>>,
}

pub struct HandleCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl HandleCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::new(cap),
                live: HashMap::new(),
            }),
            capacity: cap.get(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handles currently pinned by the LRU.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle for `path`, creating the log (and its directories) if needed.
    pub fn open_for_append(&self, path: &Path) -> io::Result<Arc<LogFile>> {
        self.get(path, true)
    }

    /// Handle for an existing log; `NotFound` if it was never written.
    pub fn open_existing(&self, path: &Path) -> io::Result<Arc<LogFile>> {
        self.get(path, false)
    }

    fn get(&self, path: &Path, create: bool) -> io::Result<Arc<LogFile>> {
        let mut inner = self.inner.lock();
        if let Some(log) = inner.lru.get(path) {
            return Ok(Arc::clone(log));
        }

        let log = match inner.live.get(path).and_then(Weak::upgrade) {
            Some(log) => log,
            None => {
                if create {
                    if let Some(dir) = path.parent() {
                        fs::create_dir_all(dir)?;
                    }
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(create)
                    .truncate(false)
                    .open(path)?;
                let log = Arc::new(LogFile {
                    path: path.to_path_buf(),
                    file: Mutex::new(file),
                });
                inner.live.insert(path.to_path_buf(), Arc::downgrade(&log));
                log
            }
        };

        if let Some((evicted, _)) = inner.lru.push(path.to_path_buf(), Arc::clone(&log)) {
            if evicted != path {
                log::trace!("closing log handle {}", evicted.display());
            }
        }
        if inner.live.len() > self.capacity * 2 {
            inner.live.retain(|_, weak| weak.strong_count() > 0);
        }
        Ok(log)
    }

    /// Drop every cached handle under `dir`, before the directory is removed.
    pub fn forget_under(&self, dir: &Path) {
        let mut inner = self.inner.lock();
        let doomed: Vec<PathBuf> = inner
            .lru
            .iter()
            .filter(|(p, _)| p.starts_with(dir))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &doomed {
            inner.lru.pop(p);
        }
        inner.live.retain(|p, _| !p.starts_with(dir));
        if !doomed.is_empty() {
            log::trace!("closed {} log handles under {}", doomed.len(), dir.display());
        }
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLE_CAPACITY)
    }
}
