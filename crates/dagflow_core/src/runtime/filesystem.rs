use std::fmt::Debug;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use dagflow_error::{DbError, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Access to files, local or remote.
pub trait FileSystem: Debug + Sync + Send {
    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Open a file for writing, truncating any existing file.
    ///
    /// Written bytes are only guaranteed to be visible to readers after the
    /// writer has been flushed or dropped.
    fn open_for_write(&self, path: &str) -> Result<Box<dyn Write + Send>>;
}

/// Flat in-memory file system.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().contains_key(&normalize(path))
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

impl FileSystem for MemoryFileSystem {
    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let path = normalize(path);
        let buf = self
            .files
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| DbError::resource(format!("Cannot find file '{path}'")))?;
        Ok(Box::new(Cursor::new(buf)))
    }

    fn open_for_write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let path = normalize(path);
        if path.is_empty() {
            return Err(DbError::resource("Cannot write to an empty path"));
        }
        self.files.lock().insert(path.clone(), Bytes::new());
        Ok(Box::new(MemoryFileWriter {
            path,
            buf: Vec::new(),
            files: self.files.clone(),
        }))
    }
}

#[derive(Debug)]
struct MemoryFileWriter {
    path: String,
    buf: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryFileWriter {
    fn commit(&self) {
        self.files
            .lock()
            .insert(self.path.clone(), Bytes::copy_from_slice(&self.buf));
    }
}

impl Write for MemoryFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryFileWriter {
    fn drop(&mut self) {
        self.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let fs = MemoryFileSystem::new();
        {
            let mut w = fs.open_for_write("/a/b.txt").unwrap();
            w.write_all(b"hello").unwrap();
        }

        let mut s = String::new();
        fs.open_for_read("a/b.txt").unwrap().read_to_string(&mut s).unwrap();
        assert_eq!("hello", s);
        assert_eq!(vec!["a/b.txt".to_string()], fs.file_names());
    }

    #[test]
    fn missing_file() {
        let fs = MemoryFileSystem::new();
        let err = fs.open_for_read("nope").err().unwrap();
        assert_eq!(dagflow_error::ErrorKind::Resource, err.kind());
    }
}
