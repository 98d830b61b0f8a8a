//! Size-based rotating log file, usable as a `tracing_subscriber` writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// `<base>.log` is the live file; `<base>.log.1` .. `<base>.log.N-1` are
/// older generations, highest index oldest.
struct RollingFile {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RollingFile {
    fn open(dir: PathBuf, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut rolling = Self {
            dir,
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            written: 0,
        };
        rolling.reopen()?;
        if rolling.written > rolling.max_size {
            rolling.roll()?;
        }
        Ok(rolling)
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn generation_path(&self, generation: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, generation))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let oldest = self.max_files - 1;
        if oldest > 0 {
            let dropped = self.generation_path(oldest);
            if dropped.exists() {
                fs::remove_file(&dropped)?;
            }
            for generation in (1..oldest).rev() {
                let src = self.generation_path(generation);
                if src.exists() {
                    fs::rename(&src, self.generation_path(generation + 1))?;
                }
            }
            let live = self.live_path();
            if live.exists() {
                fs::rename(live, self.generation_path(1))?;
            }
        } else {
            // Single-file mode: truncate in place.
            fs::write(self.live_path(), b"")?;
        }

        self.reopen()
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Cloneable handle to a rotating log file.
#[derive(Clone)]
pub struct RollingWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl RollingWriter {
    pub fn open(
        dir: PathBuf,
        base_name: &str,
        max_files: usize,
        max_size: u64,
    ) -> io::Result<Self> {
        let file = RollingFile::open(dir, base_name, max_files, max_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut RollingFile) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut guard)
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_over_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RollingWriter::open(dir.path().to_path_buf(), "sentinel", 3, 16).unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"abcdefghij").unwrap();
        writer.write_all(b"ABCDEFGHIJ").unwrap();
        writer.flush().unwrap();

        let live = fs::read_to_string(dir.path().join("sentinel.log")).unwrap();
        let gen1 = fs::read_to_string(dir.path().join("sentinel.log.1")).unwrap();
        let gen2 = fs::read_to_string(dir.path().join("sentinel.log.2")).unwrap();
        assert_eq!(live, "ABCDEFGHIJ");
        assert_eq!(gen1, "abcdefghij");
        assert_eq!(gen2, "0123456789");
    }

    #[test]
    fn keeps_at_most_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RollingWriter::open(dir.path().to_path_buf(), "plugin", 2, 4).unwrap();
        for chunk in [b"aaaa", b"bbbb", b"cccc"] {
            writer.write_all(chunk).unwrap();
        }

        assert!(dir.path().join("plugin.log.1").exists());
        assert!(!dir.path().join("plugin.log.2").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("plugin.log")).unwrap(),
            "cccc"
        );
    }

    #[test]
    fn sanitizes_app_name() {
        assert_eq!(sanitize_name("rawflow sentinel/1"), "rawflow_sentinel_1");
    }
}
