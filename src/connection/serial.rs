use std::{io::Write, time::Duration};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::{
    connection::{read_interface, Link},
    error::Error,
};

/// Serial port [Link].
pub struct SerialConnection {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialConnection {
    pub fn open(name: &str, baud: u32, timeout: Duration) -> Result<Self, Error> {
        let port = serialport::new(name, baud).timeout(timeout).open()?;
        debug!("opened {} at {} baud", name, baud);
        Ok(Self {
            name: name.to_string(),
            port: Some(port),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, Error> {
        self.port.as_mut().ok_or(Error::Closed)
    }
}

impl Link for SerialConnection {
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        let port = self.port()?;
        let mut buf = vec![0; size];
        let mut filled = 0;
        while filled < size {
            match read_interface(port, &mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error> {
        let port = self.port()?;
        let mut data = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        loop {
            match read_interface(port, &mut byte)? {
                0 => break,
                _ => {
                    data.push(byte[0]);
                    if data.ends_with(delimiter) {
                        break;
                    }
                },
            }
        }
        Ok(data)
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        let pending = self.port()?.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        self.read(pending)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.port()?.write_all(data)?;
        Ok(data.len())
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        Ok(self.port()?.bytes_to_read()? > 0)
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closed {}", self.name);
        }
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.port()?.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port()?.set_timeout(timeout)?;
        Ok(())
    }
}
