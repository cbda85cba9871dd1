use super::{EntryIter, FileEntry, StagedFile, StorageBackend};
use crate::error::{Error, Result};
use crate::scanner::walk::{self, IgnoreSet, TEMP_MARKER};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A directory tree on a mounted filesystem (local disk or network share).
pub struct LocalBackend {
    root: PathBuf,
    ignore: IgnoreSet,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>, ignore: IgnoreSet) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ignore,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    fn temp_name(relative: &str) -> String {
        let (dir, name) = match relative.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, relative),
        };
        let temp = format!(
            ".{}{}{}-{}",
            name,
            TEMP_MARKER,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        match dir {
            Some(dir) => format!("{}/{}", dir, temp),
            None => temp,
        }
    }
}

impl StorageBackend for LocalBackend {
    fn scan(&self) -> Result<EntryIter<'_>> {
        if !self.root.is_dir() {
            return Err(Error::file_access(
                self.root.display().to_string(),
                io::Error::new(io::ErrorKind::NotFound, "location root is not a directory"),
            ));
        }
        Ok(Box::new(walk::walk_local(&self.root, self.ignore.clone())))
    }

    fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        match fs::metadata(self.full_path(path)) {
            Ok(metadata) if metadata.is_file() => Ok(Some(FileEntry {
                path: path.to_string(),
                size: metadata.len(),
                mtime: walk::mtime_secs(&metadata),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_access(path, e)),
        }
    }

    fn transfer_out(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.full_path(path)).map_err(|e| Error::file_access(path, e))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn transfer_in(&self, path: &str, reader: &mut dyn Read, mtime: i64) -> Result<StagedFile> {
        let staged = StagedFile {
            temp_path: Self::temp_name(path),
            final_path: path.to_string(),
        };
        let temp = self.full_path(&staged.temp_path);
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::file_access(path, e))?;
        }

        let mut write = || -> io::Result<()> {
            let mut file = File::create(&temp)?;
            io::copy(reader, &mut file)?;
            file.flush()?;
            if mtime > 0 {
                file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime as u64))?;
            }
            file.sync_all()
        };
        if let Err(e) = write() {
            if let Err(cleanup) = fs::remove_file(&temp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("Could not remove temp file {}: {}", temp.display(), cleanup);
                }
            }
            return Err(Error::file_access(path, e));
        }
        debug!("Staged {} as {}", path, staged.temp_path);
        Ok(staged)
    }

    fn promote(&self, staged: &StagedFile) -> Result<()> {
        fs::rename(
            self.full_path(&staged.temp_path),
            self.full_path(&staged.final_path),
        )
        .map_err(|e| Error::file_access(&staged.final_path, e))
    }

    fn discard(&self, staged: &StagedFile) -> Result<()> {
        match fs::remove_file(self.full_path(&staged.temp_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::file_access(&staged.temp_path, e)),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::file_access(path, e)),
        }
    }
}
