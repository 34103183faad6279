use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use log::debug;

use crate::{connection::Link, error::Error};

const DATAGRAM_SIZE: usize = 2048;

/// UDP [Link]. Datagrams are reassembled into a byte stream.
pub struct UdpConnection {
    socket: Option<UdpSocket>,
    remote: SocketAddr,
    pending: Vec<u8>,
}

impl UdpConnection {
    pub fn open(
        remote_ip: IpAddr,
        remote_port: u16,
        local_port: u16,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port,
        ))?;
        socket.set_read_timeout(Some(timeout))?;
        debug!(
            "udp socket bound on {} for {}:{}",
            local_port, remote_ip, remote_port
        );
        Ok(Self {
            socket: Some(socket),
            remote: SocketAddr::new(remote_ip, remote_port),
            pending: Vec::new(),
        })
    }

    /// Receives one datagram, None on timeout (or when nothing is pending
    /// in non-blocking mode).
    fn recv(&mut self, blocking: bool) -> Result<Option<Vec<u8>>, Error> {
        let socket = self.socket.as_ref().ok_or(Error::Closed)?;
        socket.set_nonblocking(!blocking)?;
        let mut buf = [0u8; DATAGRAM_SIZE];
        match socket.recv_from(&mut buf) {
            Ok((size, _)) => Ok(Some(buf[..size].to_vec())),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => Ok(None),
                _ => Err(e.into()),
            },
        }
    }
}

impl Link for UdpConnection {
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        while self.pending.len() < size {
            match self.recv(true)? {
                Some(datagram) => self.pending.extend_from_slice(&datagram),
                None => break,
            }
        }
        let size = size.min(self.pending.len());
        Ok(self.pending.drain(..size).collect())
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(pos) = self
                .pending
                .windows(delimiter.len())
                .position(|w| w == delimiter)
            {
                return Ok(self.pending.drain(..pos + delimiter.len()).collect());
            }
            match self.recv(true)? {
                Some(datagram) => self.pending.extend_from_slice(&datagram),
                None => return Ok(std::mem::take(&mut self.pending)),
            }
        }
    }

    /// At most one datagram per call, so a flooding peer cannot hold the caller.
    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        if let Some(datagram) = self.recv(false)? {
            self.pending.extend_from_slice(&datagram);
        }
        Ok(std::mem::take(&mut self.pending))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let socket = self.socket.as_ref().ok_or(Error::Closed)?;
        Ok(socket.send_to(data, self.remote)?)
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        match self.recv(false)? {
            Some(datagram) => {
                self.pending.extend_from_slice(&datagram);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        self.pending.clear();
        while self.recv(false)?.is_some() {}
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
        self.pending.clear();
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        let socket = self.socket.as_ref().ok_or(Error::Closed)?;
        socket.set_read_timeout(Some(timeout))?;
        Ok(())
    }
}
