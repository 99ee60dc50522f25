//! Durable storage for rotated history buffers. Writes happen on a
//! background thread over an owned snapshot, so the kernel lock is never held
//! across file I/O.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tally_history::RotatedBuffer;

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("history-{generation:05}.bin"))
    }

    /// Write one rotated generation (temp file + rename).
    pub fn write(&self, rotated: &RotatedBuffer) -> std::io::Result<PathBuf> {
        let path = self.path_for(rotated.generation);
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&rotated.data)?;
            file.flush()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Hand a rotated buffer to a background thread for writing. The buffer
    /// is an owned snapshot; the caller goes straight back under its lock.
    pub fn flush_async(&self, rotated: RotatedBuffer) -> thread::JoinHandle<()> {
        let store = self.clone();
        thread::spawn(move || match store.write(&rotated) {
            Ok(path) => {
                crate::metrics::BUFFERS_FLUSHED.inc();
                tracing::debug!(
                    path = %path.display(),
                    bytes = rotated.data.len(),
                    "history buffer flushed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    generation = rotated.generation,
                    error = %err,
                    "failed to flush history buffer"
                );
            }
        })
    }

    /// All stored generations plus the given live tail path order, oldest
    /// first.
    pub fn list(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "bin")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("history-"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub fn load(path: &Path) -> std::io::Result<Vec<u8>> {
        fs::read(path)
    }
}
