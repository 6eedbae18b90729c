//! Append-only two-file log spool.
//!
//! Lines go to `node.log1.txt`. When it grows past the cap it becomes
//! `node.log2.txt` (replacing the previous one) and a fresh current file is
//! started, so at most two generations are kept on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const CURRENT_FILE: &str = "node.log1.txt";
pub const PREVIOUS_FILE: &str = "node.log2.txt";

/// Default size at which the current file is rotated.
pub const DEFAULT_CAP: u64 = 4 * 1024 * 1024;

pub struct Spool {
    dir: PathBuf,
    cap: u64,
    file: File,
    size: u64,
}

impl Spool {
    pub fn open(dir: &Path, cap: u64) -> io::Result<Self> {
        let (file, size) = open_current(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cap,
            file,
            size,
        })
    }

    /// Append one line; a trailing newline is added.
    pub fn append(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.size > 0 && self.size + len > self.cap {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.size += len;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(self.dir.join(CURRENT_FILE), self.dir.join(PREVIOUS_FILE))?;
        let (file, size) = open_current(&self.dir)?;
        self.file = file;
        self.size = size;
        tracing::debug!(dir = %self.dir.display(), "Rotated log spool");
        Ok(())
    }
}

fn open_current(dir: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(CURRENT_FILE))?;
    let size = file.metadata()?.len();
    Ok((file, size))
}

/// Every spooled line in `dir`, oldest first.
pub fn read_lines(dir: &Path) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    for name in [PREVIOUS_FILE, CURRENT_FILE] {
        let file = match File::open(dir.join(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut spool = Spool::open(dir.path(), DEFAULT_CAP).unwrap();
            spool.append("first").unwrap();
            spool.sync().unwrap();
        }
        let mut spool = Spool::open(dir.path(), DEFAULT_CAP).unwrap();
        spool.append("second").unwrap();
        spool.sync().unwrap();

        assert_eq!(read_lines(dir.path()).unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn rotation_keeps_two_generations() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = Spool::open(dir.path(), 12).unwrap();
        for line in ["aaaaa", "bbbbb", "ccccc", "ddddd", "eeeee"] {
            spool.append(line).unwrap();
        }
        spool.sync().unwrap();

        // Two 6-byte lines fit per file; the oldest generation is gone.
        assert_eq!(
            read_lines(dir.path()).unwrap(),
            vec!["ccccc", "ddddd", "eeeee"]
        );
        assert!(dir.path().join(PREVIOUS_FILE).exists());
    }
}
