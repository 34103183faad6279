use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
};

use crate::{
    connection::{read_interface, Link},
    error::Error,
};

/// Replay chunk size.
const READ_CHUNK: usize = 4096;

/// Read only [Link], replaying a recorded stream byte for byte.
pub struct FileReader {
    reader: Option<BufReader<File>>,
}

impl FileReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let fd = File::open(path)?;
        Ok(Self {
            reader: Some(BufReader::new(fd)),
        })
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>, Error> {
        self.reader.as_mut().ok_or(Error::Closed)
    }
}

impl Link for FileReader {
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(size);
        self.reader()?.take(size as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error> {
        let reader = self.reader()?;
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        while read_interface(reader, &mut byte)? > 0 {
            data.push(byte[0]);
            if data.ends_with(delimiter) {
                break;
            }
        }
        Ok(data)
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; READ_CHUNK];
        let size = read_interface(self.reader()?, &mut buf)?;
        buf.truncate(size);
        Ok(buf)
    }

    fn write(&mut self, _: &[u8]) -> Result<usize, Error> {
        Err(Error::Unsupported("write"))
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        Ok(!self.reader()?.fill_buf()?.is_empty())
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Write only [Link]: reads come back empty.
pub struct FileWriter {
    writer: Option<BufWriter<File>>,
}

impl FileWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        let fd = File::create(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(fd)),
        })
    }
}

impl Link for FileWriter {
    fn read(&mut self, _: usize) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn read_until(&mut self, _: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let writer = self.writer.as_mut().ok_or(Error::Closed)?;
        writer.write_all(data)?;
        Ok(data.len())
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        Ok(false)
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.close();
    }
}
