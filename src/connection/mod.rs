//! Byte transports to and from the device.
use std::{net::IpAddr, path::PathBuf, time::Duration};

mod file;
mod serial;
mod udp;

#[cfg(test)]
pub(crate) mod memory;

pub use file::{FileReader, FileWriter};
pub use serial::SerialConnection;
pub use udp::UdpConnection;

use crate::error::Error;

/// Default blocking read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(400);

/// Common transport interface.
///
/// Reads never block longer than the link timeout: a timeout simply
/// returns what was gathered so far (possibly nothing).
pub trait Link: Send {
    /// Reads up to `size` bytes.
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error>;

    /// Reads until `delimiter` (included) or timeout.
    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error>;

    /// Returns whatever is pending, without blocking.
    fn read_all_available(&mut self) -> Result<Vec<u8>, Error>;

    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// True when bytes are pending.
    fn data_ready(&mut self) -> Result<bool, Error>;

    /// Discards pending input.
    fn reset_input_buffer(&mut self) -> Result<(), Error>;

    fn close(&mut self);

    /// Baud rate only applies to serial links.
    fn set_baud(&mut self, _baud: u32) -> Result<(), Error> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        (**self).read(size)
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error> {
        (**self).read_until(delimiter)
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        (**self).read_all_available()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        (**self).write(data)
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        (**self).data_ready()
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        (**self).reset_input_buffer()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        (**self).set_baud(baud)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        (**self).set_timeout(timeout)
    }
}

/// Placeholder link: reads nothing, swallows writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyLink;

impl Link for DummyLink {
    fn read(&mut self, _: usize) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn read_until(&mut self, _: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn write(&mut self, _: &[u8]) -> Result<usize, Error> {
        Ok(0)
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        Ok(false)
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSettings {
    Serial {
        port: String,
        baud: u32,
        timeout: Duration,
    },
    Udp {
        remote_ip: IpAddr,
        remote_port: u16,
        local_port: u16,
    },
    /// Replays a recorded stream
    FileReader(PathBuf),
    FileWriter(PathBuf),
    Dummy,
}

impl std::fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { port, baud, .. } => write!(f, "{}@{}", port, baud),
            Self::Udp {
                remote_ip,
                remote_port,
                local_port,
            } => write!(f, "udp://{}:{} (local {})", remote_ip, remote_port, local_port),
            Self::FileReader(path) => write!(f, "{} (read)", path.display()),
            Self::FileWriter(path) => write!(f, "{} (write)", path.display()),
            Self::Dummy => write!(f, "dummy"),
        }
    }
}

/// [Connection] to the device, one variant per transport.
pub enum Connection {
    Serial(SerialConnection),
    Udp(UdpConnection),
    FileReader(FileReader),
    FileWriter(FileWriter),
    Dummy(DummyLink),
}

impl Connection {
    /// Opens a new [Connection] from [ConnectionSettings].
    pub fn open(settings: &ConnectionSettings) -> Result<Self, Error> {
        match settings {
            ConnectionSettings::Serial {
                port,
                baud,
                timeout,
            } => Ok(Self::Serial(SerialConnection::open(port, *baud, *timeout)?)),
            ConnectionSettings::Udp {
                remote_ip,
                remote_port,
                local_port,
            } => Ok(Self::Udp(UdpConnection::open(
                *remote_ip,
                *remote_port,
                *local_port,
                DEFAULT_TIMEOUT,
            )?)),
            ConnectionSettings::FileReader(path) => Ok(Self::FileReader(FileReader::open(path)?)),
            ConnectionSettings::FileWriter(path) => Ok(Self::FileWriter(FileWriter::create(path)?)),
            ConnectionSettings::Dummy => Ok(Self::Dummy(DummyLink)),
        }
    }

    fn link(&mut self) -> &mut dyn Link {
        match self {
            Self::Serial(link) => link,
            Self::Udp(link) => link,
            Self::FileReader(link) => link,
            Self::FileWriter(link) => link,
            Self::Dummy(link) => link,
        }
    }
}

impl Link for Connection {
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        self.link().read(size)
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error> {
        self.link().read_until(delimiter)
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        self.link().read_all_available()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.link().write(data)
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        self.link().data_ready()
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        self.link().reset_input_buffer()
    }

    fn close(&mut self) {
        self.link().close()
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.link().set_baud(baud)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.link().set_timeout(timeout)
    }
}

/// Timeouts are not failures: the read simply gathered nothing.
pub(crate) fn read_interface<R: std::io::Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader.read(buf) {
        Ok(size) => Ok(size),
        Err(e) => match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Ok(0),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod test {
    use super::{Connection, ConnectionSettings, DummyLink, Link};

    #[test]
    fn test_dummy_connection() {
        let mut conn = Connection::open(&ConnectionSettings::Dummy).unwrap();
        assert_eq!(conn.write(b"#APPNG*24\r\n").unwrap(), 0);
        assert!(conn.read_all_available().unwrap().is_empty());
        assert!(!conn.data_ready().unwrap());
        conn.close();

        let mut boxed: Box<dyn Link> = Box::new(DummyLink);
        assert!(boxed.read(10).unwrap().is_empty());
        assert!(boxed.set_baud(921600).is_ok());
    }

    #[test]
    fn test_settings_display() {
        let settings = ConnectionSettings::Serial {
            port: "/dev/ttyUSB0".to_string(),
            baud: 921600,
            timeout: super::DEFAULT_TIMEOUT,
        };
        assert_eq!(settings.to_string(), "/dev/ttyUSB0@921600");
    }
}
