//! A locked file wrapper.  A writable handle takes an advisory exclusive
//! lock before its first write and holds it until the handle is dropped, so
//! a second writer on the same storage file fails fast.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct File {
    inner: fs::File,
    path: PathBuf,
    // Set for temporary files; dropping it deletes the backing file.
    temp: Option<tempfile::TempPath>,
    readonly: bool,
    has_lock: bool,
}

impl File {
    /// Open or create `path`.  Opening a missing file readonly fails.
    pub fn open<P: AsRef<Path>>(path: P, readonly: bool) -> Result<File> {
        let path = path.as_ref();
        let inner = if readonly {
            fs::OpenOptions::new().read(true).open(path)?
        } else {
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?
        };
        Ok(File {
            inner,
            path: path.to_path_buf(),
            temp: None,
            readonly,
            has_lock: false,
        })
    }

    /// A writable file whose backing file is deleted on drop.
    pub fn temporary() -> Result<File> {
        let (inner, temp) = tempfile::NamedTempFile::new()?.into_parts();
        let path = temp.to_path_buf();
        Ok(File {
            inner,
            path,
            temp: Some(temp),
            readonly: false,
            has_lock: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Take the exclusive lock if we don't already hold it.
    pub fn obtain_lock(&mut self) -> Result<()> {
        assert!(!self.readonly, "cannot lock a readonly file");
        if !self.has_lock {
            self.inner.try_lock_exclusive().map_err(|err| {
                if err.kind() == fs2::lock_contended_error().kind() {
                    Error::LockHeld
                } else {
                    Error::Io(err)
                }
            })?;
            self.has_lock = true;
        }
        Ok(())
    }

    pub fn release_lock(&mut self) {
        if self.has_lock {
            let _ = self.inner.unlock();
            self.has_lock = false;
        }
    }

    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    pub fn seek_end(&mut self) -> Result<u64> {
        Ok(self.inner.seek(SeekFrom::End(0))?)
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.obtain_lock()?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    /// Truncate the file at the current position.
    pub fn truncate(&mut self) -> Result<()> {
        self.obtain_lock()?;
        let position = self.tell()?;
        self.inner.set_len(position)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.inner.sync_all()?;
        Ok(())
    }

    /// Rename the backing file; the handle and its lock follow the rename.
    pub fn rename<P: AsRef<Path>>(&mut self, new_path: P) -> Result<()> {
        let new_path = new_path.as_ref();
        if new_path == self.path {
            return Ok(());
        }
        assert!(!self.is_temporary(), "cannot rename a temporary file");
        self.obtain_lock()?;
        fs::rename(&self.path, new_path)?;
        self.path = new_path.to_path_buf();
        Ok(())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.release_lock();
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for File {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // The lock is taken lazily on the first write.
        if !self.has_lock {
            self.obtain_lock().map_err(|err| match err {
                Error::Io(err) => err,
                other => std::io::Error::new(std::io::ErrorKind::WouldBlock, other.to_string()),
            })?;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_file_deletes_itself() {
        let mut file = File::temporary().unwrap();
        let path = file.path().to_path_buf();
        file.write_bytes(b"scratch").unwrap();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn second_writer_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.durus");
        let mut first = File::open(&path, false).unwrap();
        first.write_bytes(b"x").unwrap();
        let mut second = File::open(&path, false).unwrap();
        match second.obtain_lock() {
            Err(Error::LockHeld) => (),
            other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
        }
        drop(first);
        second.obtain_lock().unwrap();
    }

    #[test]
    fn readonly_open_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(File::open(dir.path().join("absent"), true).is_err());
    }

    #[test]
    fn truncate_cuts_at_current_position() {
        let mut file = File::temporary().unwrap();
        file.write_bytes(b"0123456789").unwrap();
        file.seek(4).unwrap();
        file.truncate().unwrap();
        assert_eq!(file.len().unwrap(), 4);
    }
}
