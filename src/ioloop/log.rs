//! Raw output log.
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use flate2::{Compression, write::GzEncoder};
use hifitime::prelude::Epoch;

use crate::error::Error;

/// Writes between two flushes to disk.
pub const FLUSH_FREQUENCY: usize = 200;

pub enum FileDescriptor {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl Write for FileDescriptor {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(data),
            Self::Gzip(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}

impl FileDescriptor {
    pub fn create(gzip: bool, path: &Path) -> Result<Self, Error> {
        let fd = File::create(path)?;

        if gzip {
            let compression = Compression::new(5);
            Ok(Self::Gzip(GzEncoder::new(fd, compression)))
        } else {
            Ok(Self::Plain(fd))
        }
    }

    /// Pushes written bytes down to the disk.
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        match self {
            Self::Plain(fd) => fd.sync_data(),
            Self::Gzip(w) => w.get_ref().sync_data(),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            Self::Plain(mut fd) => fd.flush(),
            Self::Gzip(w) => w.finish().map(|_| ()),
        }
    }
}

/// `<root>/<year>_<month>/<day>` for `t`, in UTC.
pub fn dated_dir(root: &Path, t: Epoch) -> PathBuf {
    let (y, m, d, _, _, _, _) = t.to_gregorian_utc();
    root.join(format!("{}_{}", y, m)).join(d.to_string())
}

/// Log file with a bounded flush cadence.
pub struct LogFile {
    path: PathBuf,
    fd: FileDescriptor,
    writes: usize,
    size: u64,
}

impl LogFile {
    /// Creates `name` inside the dated directory of `root`, ".gz" appended when compressing.
    pub fn create(root: &Path, name: &str, gzip: bool, t: Epoch) -> Result<Self, Error> {
        let dir = dated_dir(root, t);
        std::fs::create_dir_all(&dir)?;

        let name = if gzip && !name.ends_with(".gz") {
            format!("{}.gz", name)
        } else {
            name.to_string()
        };
        let path = dir.join(name);
        let fd = FileDescriptor::create(gzip, &path)?;

        Ok(Self {
            path,
            fd,
            writes: 0,
            size: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.fd.write_all(data)?;
        self.size += data.len() as u64;
        self.writes += 1;
        if self.writes >= FLUSH_FREQUENCY {
            self.writes = 0;
            self.fd.sync()?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<(), Error> {
        self.fd.finish()?;
        Ok(())
    }
}
